//! The one lock-protected block shared between stages.
//!
//! The inference stage is the only writer of the analytics fields; the
//! event stage only snapshots them, and writes back a single feedback
//! bit (`event_ended`) that tells inference to recreate its tracker
//! session. The lock is held only for the publish or the snapshot copy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use vigil_types::{FeatureVec, Track, TrackId};

#[derive(Debug, Default)]
struct SharedState {
    person_present: bool,
    tracks: Arc<Vec<Track>>,
    roi_membership: HashMap<TrackId, bool>,
    reid_features: HashMap<TrackId, FeatureVec>,
    event_ended: bool,
    frame_seq: u64,
}

/// A consistent copy of the per-frame analytics. All fields refer to the
/// same `frame_seq`.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub person_present: bool,
    pub tracks: Arc<Vec<Track>>,
    pub roi_membership: HashMap<TrackId, bool>,
    pub reid_features: HashMap<TrackId, FeatureVec>,
    pub frame_seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    inner: Arc<Mutex<SharedState>>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically publish one frame's worth of analytics.
    pub fn publish(
        &self,
        person_present: bool,
        tracks: Arc<Vec<Track>>,
        roi_membership: HashMap<TrackId, bool>,
        reid_features: HashMap<TrackId, FeatureVec>,
    ) {
        let mut state = self.inner.lock();
        state.person_present = person_present;
        state.tracks = tracks;
        state.roi_membership = roi_membership;
        state.reid_features = reid_features;
        state.frame_seq += 1;
    }

    /// Publish the nothing-seen state, used when the inference queue runs
    /// dry so absence debouncing keeps working.
    pub fn publish_empty(&self) {
        self.publish(false, Arc::new(vec![]), HashMap::new(), HashMap::new());
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.inner.lock();
        StateSnapshot {
            person_present: state.person_present,
            tracks: state.tracks.clone(),
            roi_membership: state.roi_membership.clone(),
            reid_features: state.reid_features.clone(),
            frame_seq: state.frame_seq,
        }
    }

    /// Event-stage feedback: an event just finished.
    pub fn set_event_ended(&self) {
        self.inner.lock().event_ended = true;
    }

    /// Inference-side check-and-clear of the feedback bit.
    pub fn take_event_ended(&self) -> bool {
        let mut state = self.inner.lock();
        std::mem::take(&mut state.event_ended)
    }
}
