//! Frame acquisition: the [`FrameSource`] trait, the ffmpeg-backed
//! implementation, and the fan-out that feeds the analysis queues.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use vigil_config_data::{SourceConfig, SourceKind, Transport};
use vigil_types::{BgrImage, Frame};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("decoder process exited ({status}): {stderr}")]
    SourceExited {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("all frame consumers disconnected")]
    Disconnected,
    #[error(transparent)]
    BadImage(#[from] vigil_types::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A source of decoded frames.
///
/// `next_frame` returning `Ok(None)` means a clean end of stream (a file
/// ran out); transport failures surface as errors. Timestamps are
/// monotonic seconds from the source's own start.
pub trait FrameSource: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Decode by piping `ffmpeg` output: raw BGR24 frames read from the child
/// process stdout in exact `width * height * 3` chunks.
///
/// File sources pass `-re` so frames arrive paced at the file's native
/// rate; network sources are paced by arrival.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: std::process::ChildStdout,
    stderr_buf: Arc<Mutex<String>>,
    width: u32,
    height: u32,
    epoch: Instant,
}

fn build_command(source: &SourceConfig) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    match source.kind {
        SourceKind::File => {
            cmd.args(["-re", "-i", source.uri.as_str()]);
        }
        SourceKind::Rtsp => match source.transport {
            Transport::Udp => {
                cmd.args([
                    "-err_detect",
                    "careful",
                    "-ec",
                    "deblock+guess_mvs",
                    "-fflags",
                    "discardcorrupt",
                    "-rtsp_transport",
                    "udp",
                    "-rtbufsize",
                    "50M",
                    "-probesize",
                    "5M",
                    "-analyzeduration",
                    "5M",
                    "-i",
                    source.uri.as_str(),
                ]);
            }
            Transport::Tcp => {
                cmd.args([
                    "-rtsp_transport",
                    "tcp",
                    "-rtbufsize",
                    "20M",
                    "-i",
                    source.uri.as_str(),
                ]);
            }
        },
    }
    cmd.args(["-f", "rawvideo", "-pix_fmt", "bgr24", "-"]);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

impl FfmpegFrameSource {
    /// Spawn the decoder child. Frames will be `width` x `height` BGR8;
    /// the source material must match (ffmpeg is not asked to scale).
    pub fn open(source: &SourceConfig, width: u32, height: u32) -> Result<Self> {
        let mut cmd = build_command(source);
        debug!("starting decoder: {cmd:?}");
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Drain stderr continuously so the child never blocks on a full
        // pipe; the collected text goes into the death report.
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf2 = stderr_buf.clone();
        std::thread::Builder::new()
            .name("decoder-stderr".into())
            .spawn(move || {
                let mut reader = std::io::BufReader::new(stderr);
                let mut text = String::new();
                if reader.read_to_string(&mut text).is_ok() {
                    *stderr_buf2.lock().unwrap() = text;
                }
            })?;

        info!("decoder started ({}x{})", width, height);
        Ok(Self {
            child,
            stdout,
            stderr_buf,
            width,
            height,
            epoch: Instant::now(),
        })
    }

    fn exit_report(&mut self) -> Result<Option<Frame>> {
        let status = self.child.wait()?;
        let stderr = self.stderr_buf.lock().unwrap().trim().to_string();
        if status.success() {
            info!("decoder reached end of stream");
            Ok(None)
        } else {
            Err(Error::SourceExited { status, stderr })
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let nbytes = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; nbytes];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {
                let timestamp = self.epoch.elapsed().as_secs_f64();
                let image = BgrImage::from_packed(self.width, self.height, buf)?;
                Ok(Some(Frame::new(timestamp, image)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => self.exit_report(),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Non-blocking distribution of decoded frames into the two stage queues.
///
/// The inference queue stays near-real-time: when it is full its oldest
/// entry is evicted so the newest frame lands. The event queue is the
/// recording fabric: when it is full the incoming frame is dropped and the
/// queued history survives.
pub struct FrameFanout {
    inference_tx: Sender<Frame>,
    inference_rx: Receiver<Frame>,
    event_tx: Sender<Frame>,
    dropped_event_frames: u64,
}

impl FrameFanout {
    pub fn new(
        inference_tx: Sender<Frame>,
        inference_rx: Receiver<Frame>,
        event_tx: Sender<Frame>,
    ) -> Self {
        Self {
            inference_tx,
            inference_rx,
            event_tx,
            dropped_event_frames: 0,
        }
    }

    /// Offer the frame to both consumers.
    ///
    /// The inference side is best-effort (the fan-out holds a receiver
    /// handle for eviction, so a vanished inference stage shows up via the
    /// supervisor's health check, not here). Losing the event consumer is
    /// fatal for the producer: the recording fabric is gone.
    pub fn publish(&mut self, frame: Frame) -> Result<()> {
        match self.inference_tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(f)) => {
                // Newest wins: make room by discarding the oldest entry.
                let _ = self.inference_rx.try_recv();
                let _ = self.inference_tx.try_send(f);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }

        match self.event_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped_event_frames += 1;
                if self.dropped_event_frames.is_power_of_two() {
                    warn!(
                        "event queue full; dropped {} frame(s) so far",
                        self.dropped_event_frames
                    );
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }
}

/// Why the decoder worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderExit {
    EndOfStream,
    Stopped,
}

/// The decoder worker loop: read frames until end of stream, a stop
/// request, or a transport error.
pub fn run_decoder(
    source: &mut dyn FrameSource,
    fanout: &mut FrameFanout,
    stop: &AtomicBool,
) -> Result<DecoderExit> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(DecoderExit::Stopped);
        }
        match source.next_frame()? {
            Some(frame) => match fanout.publish(frame) {
                Ok(()) => {}
                Err(Error::Disconnected) => return Ok(DecoderExit::Stopped),
                Err(e) => return Err(e),
            },
            None => return Ok(DecoderExit::EndOfStream),
        }
    }
}
