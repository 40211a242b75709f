//! The ffmpeg-backed clip sink: raw BGR24 frames piped to a child process
//! encoding HEVC into an MP4 container.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::debug;

use vigil_config_data::EncodingMode;
use vigil_types::BgrImage;

use crate::{Error, FrameSink, Result, SinkFactory};

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub mode: EncodingMode,
    pub target_bitrate_mbps: f64,
}

pub struct FfmpegClipSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FfmpegClipSink {
    pub fn create(path: &Path, fps: f64, settings: &EncoderSettings) -> Result<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-vcodec", "rawvideo"])
            .arg("-s")
            .arg(format!("{}x{}", settings.width, settings.height))
            .args(["-pix_fmt", "bgr24"])
            .arg("-r")
            .arg(format!("{fps}"))
            .args(["-i", "-"])
            .args(["-c:v", "hevc_nvenc", "-preset", "p6"]);
        match settings.mode {
            EncodingMode::Balanced => {
                let bitrate = format!("{}M", settings.target_bitrate_mbps);
                cmd.arg("-rc")
                    .arg("cbr")
                    .arg("-b:v")
                    .arg(&bitrate)
                    .arg("-maxrate")
                    .arg(&bitrate);
            }
            EncodingMode::Quality => {
                cmd.args(["-rc", "vbr", "-cq", "30", "-b:v", "0", "-maxrate", "10M"]);
            }
        }
        cmd.args(["-pix_fmt", "yuv420p"]).arg(path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("starting encoder: {cmd:?}");

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        Ok(Self {
            child: Some(child),
            stdin,
            width: settings.width,
            height: settings.height,
        })
    }

    fn child_failure(child: Child) -> Error {
        match child.wait_with_output() {
            Ok(output) => Error::Ffmpeg {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Err(e) => e.into(),
        }
    }
}

impl FrameSink for FfmpegClipSink {
    fn write_frame(&mut self, image: &BgrImage) -> Result<()> {
        if image.width != self.width || image.height != self.height {
            return Err(Error::FrameSizeMismatch {
                got_width: image.width,
                got_height: image.height,
                want_width: self.width,
                want_height: self.height,
            });
        }
        let stdin = self.stdin.as_mut().ok_or(Error::AlreadyFinished)?;
        let row_bytes = image.width as usize * 3;
        let result = if image.stride == row_bytes {
            stdin.write_all(&image.data)
        } else {
            image
                .data
                .chunks(image.stride)
                .take(image.height as usize)
                .try_for_each(|row| stdin.write_all(&row[..row_bytes]))
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // The encoder died under us; collect its complaint.
                self.stdin = None;
                match self.child.take() {
                    Some(child) => Err(Self::child_failure(child)),
                    None => Err(Error::AlreadyFinished),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let stdin = self.stdin.take().ok_or(Error::AlreadyFinished)?;
        // Closing stdin tells ffmpeg to flush and exit.
        drop(stdin);
        let child = self.child.take().ok_or(Error::AlreadyFinished)?;
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Ffmpeg {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Drop for FfmpegClipSink {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// The production sink factory.
pub struct FfmpegSinkFactory {
    pub settings: EncoderSettings,
}

impl SinkFactory for FfmpegSinkFactory {
    fn create(&self, path: &Path, fps: f64) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(FfmpegClipSink::create(path, fps, &self.settings)?))
    }
}
