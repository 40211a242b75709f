//! Event clip production: overlay rendering, HEVC compression through an
//! ffmpeg child process, Re-ID reconciliation, event persistence, and
//! notification — all running on a bounded pool of background workers so
//! encoding never stalls the capture pipeline.

use std::path::Path;

use vigil_types::{BgrImage, EventKind, FeatureVec, RecordedFrame};

pub mod overlay;

mod job;
mod pool;
mod sink;

pub use job::{allocate_clip_path, sample_frames, ClipContext};
pub use pool::ClipWriterPool;
pub use sink::{EncoderSettings, FfmpegClipSink, FfmpegSinkFactory};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("encoder process failed ({status}): {stderr}")]
    Ffmpeg {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("sink already finished")]
    AlreadyFinished,
    #[error("frame is {got_width}x{got_height}, encoder expects {want_width}x{want_height}")]
    FrameSizeMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },
    #[error("store error: {source}")]
    Store {
        #[from]
        source: vigil_store::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A streaming consumer of annotated frames producing one compressed clip.
///
/// `finish` flushes and closes the output; an error from either method
/// means the partial output must be discarded.
pub trait FrameSink: Send {
    fn write_frame(&mut self, image: &BgrImage) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Creates one sink per event clip. The production factory shells out to
/// ffmpeg; tests substitute in-memory fakes.
pub trait SinkFactory: Send + Sync {
    fn create(&self, path: &Path, fps: f64) -> Result<Box<dyn FrameSink>>;
}

/// Downstream announcement of a persisted event. Failures are logged by
/// the implementation and never retried.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, attachment: Option<&Path>);
}

/// A notifier that does nothing.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _message: &str, _attachment: Option<&Path>) {}
}

/// One finalized event recording, handed off by the event state machine.
#[derive(Debug, Clone)]
pub struct ClipJob {
    pub frames: Vec<RecordedFrame>,
    pub kind: EventKind,
    pub features: Vec<FeatureVec>,
    /// Frame rate observed over the recording.
    pub observed_fps: f64,
    /// Capture time of the trigger; earlier frames are pre-event context.
    pub event_start: f64,
    /// When the last person left, for post-event captions. `None` when
    /// the event was cut by the duration cap.
    pub person_gone_at: Option<f64>,
}

/// Where the state machine hands finished recordings. Implemented by
/// [`ClipWriterPool`]; tests collect jobs instead.
pub trait ClipSubmitter: Send + Sync {
    fn submit(&self, job: ClipJob);
}
