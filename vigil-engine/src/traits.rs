//! Interfaces to the external analytics collaborators. Production
//! implementations live outside this crate (sidecar processes, hardware
//! accelerators); tests use in-memory fakes.

use vigil_types::{BgrImage, FeatureVec, RectF, Track};

/// Collaborator error type: opaque to the pipeline, logged and skipped
/// per frame.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One raw detection, before tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: RectF,
    pub confidence: f32,
}

/// Person detector: analysis-resolution BGR frame in, person boxes out.
pub trait Detector: Send {
    fn detect(&mut self, image: &BgrImage) -> std::result::Result<Vec<Detection>, DynError>;
}

/// Multi-object tracker. Ids are stable within one tracker instance and
/// never reused by it.
pub trait Tracker: Send {
    fn update(
        &mut self,
        detections: &[Detection],
        image: &BgrImage,
    ) -> std::result::Result<Vec<Track>, DynError>;
}

/// Creates tracker sessions. A fresh session is created at startup and
/// after every event ends; failure to create one is fatal.
pub trait TrackerFactory: Send {
    fn create(&self) -> std::result::Result<Box<dyn Tracker>, DynError>;
}

/// Re-ID embedding extractor over a batch of person crops. Returns one
/// feature vector per crop, in order.
pub trait FeatureExtractor: Send {
    fn extract(
        &mut self,
        crops: &[BgrImage],
    ) -> std::result::Result<Vec<FeatureVec>, DynError>;
}
