//! The analysis core: one inference worker and one event-machine worker,
//! coupled through [`SharedState`] and fed by bounded frame queues.

pub mod event_sm;
pub mod inference;
pub mod ring;
pub mod shared_state;
pub mod tracker;
pub mod traits;

pub use event_sm::{EventStateMachine, SmConfig};
pub use inference::{InferenceConfig, InferenceStage};
pub use ring::PreEventBuffer;
pub use shared_state::{SharedStore, StateSnapshot};
pub use tracker::GreedyIouTracker;
pub use traits::{Detection, Detector, DynError, FeatureExtractor, Tracker, TrackerFactory};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The tracker factory failed; the worker cannot continue.
    #[error("tracker construction failed: {0}")]
    TrackerConstruction(DynError),
}

pub type Result<T> = std::result::Result<T, Error>;
