//! The sidecar analyzer: detection and Re-ID embedding served by an
//! external process over a line-oriented protocol.
//!
//! Each request is one JSON header line followed by the raw BGR24
//! payload(s) it announces; each response is one JSON line.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::{debug, info};

use vigil_engine::{Detection, Detector, DynError, FeatureExtractor};
use vigil_types::{BgrImage, FeatureVec, RectF};

pub struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    features: Vec<Vec<f32>>,
}

impl SidecarProcess {
    /// Spawn `command` (whitespace-split into program and arguments) with
    /// piped stdin/stdout. Stderr is inherited so the sidecar's own logs
    /// interleave with ours.
    pub fn spawn(command: &str) -> std::io::Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty sidecar command")
        })?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
        info!("analyzer sidecar started: {command}");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    fn roundtrip(
        &mut self,
        header: serde_json::Value,
        payloads: &[&BgrImage],
    ) -> Result<String, DynError> {
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        for image in payloads {
            let row_bytes = image.width as usize * 3;
            if image.stride == row_bytes {
                self.stdin.write_all(&image.data)?;
            } else {
                for row in image.data.chunks(image.stride).take(image.height as usize) {
                    self.stdin.write_all(&row[..row_bytes])?;
                }
            }
        }
        self.stdin.flush()?;

        let mut response = String::new();
        let n = self.stdout.read_line(&mut response)?;
        if n == 0 {
            return Err("analyzer sidecar closed its stdout".into());
        }
        Ok(response)
    }
}

impl Drop for SidecarProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Shared handle; the detector and the extractor may be the same process.
#[derive(Clone)]
pub struct SidecarAnalyzer {
    inner: Arc<Mutex<SidecarProcess>>,
}

impl SidecarAnalyzer {
    pub fn spawn(command: &str) -> std::io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(SidecarProcess::spawn(command)?)),
        })
    }

    pub fn detector(&self) -> SidecarDetector {
        SidecarDetector {
            analyzer: self.clone(),
        }
    }

    pub fn extractor(&self) -> SidecarExtractor {
        SidecarExtractor {
            analyzer: self.clone(),
        }
    }
}

pub struct SidecarDetector {
    analyzer: SidecarAnalyzer,
}

impl Detector for SidecarDetector {
    fn detect(&mut self, image: &BgrImage) -> Result<Vec<Detection>, DynError> {
        let header = serde_json::json!({
            "op": "detect",
            "width": image.width,
            "height": image.height,
        });
        let response = {
            let mut process = self.analyzer.inner.lock().unwrap();
            process.roundtrip(header, &[image])?
        };
        let parsed: DetectResponse = serde_json::from_str(&response)?;
        debug!("sidecar returned {} detection(s)", parsed.detections.len());
        Ok(parsed
            .detections
            .into_iter()
            .map(|d| Detection {
                bbox: RectF {
                    x1: d.x1,
                    y1: d.y1,
                    x2: d.x2,
                    y2: d.y2,
                },
                confidence: d.confidence,
            })
            .collect())
    }
}

pub struct SidecarExtractor {
    analyzer: SidecarAnalyzer,
}

impl FeatureExtractor for SidecarExtractor {
    fn extract(&mut self, crops: &[BgrImage]) -> Result<Vec<FeatureVec>, DynError> {
        let dims: Vec<serde_json::Value> = crops
            .iter()
            .map(|c| serde_json::json!({"width": c.width, "height": c.height}))
            .collect();
        let header = serde_json::json!({"op": "embed", "crops": dims});
        let payloads: Vec<&BgrImage> = crops.iter().collect();
        let response = {
            let mut process = self.analyzer.inner.lock().unwrap();
            process.roundtrip(header, &payloads)?
        };
        let parsed: EmbedResponse = serde_json::from_str(&response)?;
        if parsed.features.len() != crops.len() {
            return Err(format!(
                "sidecar returned {} feature(s) for {} crop(s)",
                parsed.features.len(),
                crops.len()
            )
            .into());
        }
        Ok(parsed.features.into_iter().map(FeatureVec::new).collect())
    }
}
