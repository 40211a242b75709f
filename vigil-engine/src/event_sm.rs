//! The event state machine: pre-event buffering, trigger detection, the
//! capture lifecycle, and segmentation.
//!
//! The machine is single-threaded. Every dequeued frame is paired with
//! the latest [`StateSnapshot`] (not a joined stream), so the machine
//! tolerates the inference stage seeing a slightly different frame set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use clip_writer::{ClipJob, ClipSubmitter};
use vigil_config_data::{BehaviorRules, CrossDirection};
use vigil_types::geom::{segments_intersect, side_of_line, Point, Side};
use vigil_types::{EventKind, FeatureVec, Frame, RecordedFrame, TrackId};

use crate::ring::PreEventBuffer;
use crate::shared_state::{SharedStore, StateSnapshot};

const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SmConfig {
    pub pre_event_seconds: f64,
    pub post_event_seconds: f64,
    pub cooldown_period: f64,
    pub max_event_duration: f64,
    pub target_fps: f64,
}

impl SmConfig {
    pub fn ring_capacity(&self) -> usize {
        (self.pre_event_seconds * self.target_fps * 1.5).ceil() as usize
    }
}

struct DwellState {
    entered_at: f64,
    alerted: bool,
}

/// Why a capture finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    PersonGone,
    DurationCap,
    QueueEmpty,
}

pub struct EventStateMachine {
    rx: Receiver<Frame>,
    shared: SharedStore,
    rules: BehaviorRules,
    cfg: SmConfig,
    submitter: Arc<dyn ClipSubmitter>,

    ring: PreEventBuffer,
    capturing: bool,
    recording: Vec<RecordedFrame>,
    event_features: Vec<FeatureVec>,
    event_kind: EventKind,
    event_start: f64,
    last_person_seen: f64,
    last_event_end: f64,
    last_frame_time: f64,

    dwell: HashMap<TrackId, DwellState>,
    last_positions: HashMap<TrackId, Point>,
    active_alert_ids: HashSet<TrackId>,
}

impl EventStateMachine {
    pub fn new(
        rx: Receiver<Frame>,
        shared: SharedStore,
        rules: BehaviorRules,
        cfg: SmConfig,
        submitter: Arc<dyn ClipSubmitter>,
    ) -> Self {
        let ring = PreEventBuffer::new(cfg.ring_capacity());
        Self {
            rx,
            shared,
            rules,
            cfg,
            submitter,
            ring,
            capturing: false,
            recording: Vec::new(),
            event_features: Vec::new(),
            event_kind: EventKind::PersonDetected,
            event_start: 0.0,
            last_person_seen: 0.0,
            // No cooldown before the first event.
            last_event_end: f64::NEG_INFINITY,
            last_frame_time: 0.0,
            dwell: HashMap::new(),
            last_positions: HashMap::new(),
            active_alert_ids: HashSet::new(),
        }
    }

    /// The worker loop: drain frames, finalize on queue starvation, stop
    /// cooperatively.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!("event stage running");
        loop {
            if stop.load(Ordering::Relaxed) {
                // Drain what is already queued; those frames are the
                // tail of the recording fabric.
                while let Ok(frame) = self.rx.try_recv() {
                    let snapshot = self.shared.snapshot();
                    self.process_frame(frame, &snapshot);
                }
                break;
            }
            match self.rx.recv_timeout(QUEUE_POLL_TIMEOUT) {
                Ok(frame) => {
                    let snapshot = self.shared.snapshot();
                    self.process_frame(frame, &snapshot);
                }
                Err(RecvTimeoutError::Timeout) => self.on_queue_empty(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // The tail of a capture still becomes a clip on shutdown.
        self.on_queue_empty();
        info!("event stage stopped");
    }

    /// Process one frame against the snapshot that was current when it
    /// was dequeued. Public so scenario tests can drive the machine
    /// deterministically.
    pub fn process_frame(&mut self, frame: Frame, snapshot: &StateSnapshot) {
        let now = frame.timestamp;
        self.last_frame_time = now;

        let fired_tripwire = self.update_tripwires(snapshot);
        let fired_dwell = self.update_dwell(now, snapshot);

        let mut fired: Option<EventKind> = None;
        if fired_dwell {
            fired = Some(EventKind::DwellAlert);
        }
        if fired_tripwire {
            fired = Some(EventKind::TripwireAlert);
        }

        if self.capturing {
            if let Some(kind) = fired {
                if kind > self.event_kind {
                    info!("event elevated from {} to {}", self.event_kind, kind);
                    self.event_kind = kind;
                }
            }
        }

        let rec = RecordedFrame {
            frame,
            tracks: snapshot.tracks.clone(),
            roi_membership: snapshot.roi_membership.clone(),
            alert_ids: self.active_alert_ids.clone(),
        };
        if self.capturing {
            self.recording.push(rec);
            self.event_features
                .extend(snapshot.reid_features.values().cloned());
        } else {
            self.ring.push(rec);
        }

        if snapshot.person_present {
            self.last_person_seen = now;
        }

        if !self.capturing {
            // Cooling: inside the cooldown window nothing starts, no
            // matter what fired.
            let cooling = now - self.last_event_end <= self.cfg.cooldown_period;
            if !cooling && (fired.is_some() || snapshot.person_present) {
                let kind = fired.unwrap_or(EventKind::PersonDetected);
                info!("'{kind}' detected, starting event capture");
                self.capturing = true;
                self.event_kind = kind;
                self.recording = self.ring.take_all();
                self.event_start = now;
                self.event_features.clear();
                self.active_alert_ids.clear();
            }
        }

        if self.capturing {
            let person_gone = !snapshot.person_present
                && now - self.last_person_seen > self.cfg.post_event_seconds;
            let too_long = now - self.event_start > self.cfg.max_event_duration;
            if person_gone {
                self.finish_event(EndReason::PersonGone, now, snapshot);
            } else if too_long {
                self.finish_event(EndReason::DurationCap, now, snapshot);
            }
        }
    }

    /// Queue starvation: a capture in progress ends as if the person had
    /// left.
    pub fn on_queue_empty(&mut self) {
        if self.capturing {
            info!("frame queue empty, closing the active event");
            let now = self.last_frame_time;
            let snapshot = StateSnapshot::default();
            self.finish_event(EndReason::QueueEmpty, now, &snapshot);
        }
    }

    /// Tripwire pass. Returns whether any admissible crossing fired.
    fn update_tripwires(&mut self, snapshot: &StateSnapshot) -> bool {
        let mut fired = false;
        let mut current_ids: HashSet<TrackId> = HashSet::with_capacity(snapshot.tracks.len());

        for track in snapshot.tracks.iter() {
            current_ids.insert(track.id);
            let pos = track.bbox.bottom_center();

            if let Some(&last) = self.last_positions.get(&track.id) {
                if last != pos && !self.rules.tripwires.is_empty() {
                    for wire in &self.rules.tripwires {
                        if !segments_intersect(last, pos, wire.a, wire.b) {
                            continue;
                        }
                        let before = side_of_line(last, wire.a, wire.b);
                        let after = side_of_line(pos, wire.a, wire.b);
                        // Ties on the line never trigger.
                        if before == Side::On || after == Side::On || before == after {
                            continue;
                        }
                        let crossed_to_right = before == Side::Left && after == Side::Right;
                        let crossed_to_left = before == Side::Right && after == Side::Left;
                        let admitted = match wire.direction {
                            CrossDirection::Both => true,
                            CrossDirection::CrossToRight => crossed_to_right,
                            CrossDirection::CrossToLeft => crossed_to_left,
                        };
                        if admitted {
                            warn!("track {} crossed a tripwire", track.id);
                            self.active_alert_ids.insert(track.id);
                            fired = true;
                            break;
                        }
                    }
                }
            }
            self.last_positions.insert(track.id, pos);
        }

        // A vanished track loses its motion history and its highlight.
        self.last_positions.retain(|id, _| current_ids.contains(id));
        self.active_alert_ids.retain(|id| current_ids.contains(id));
        fired
    }

    /// Dwell pass. Returns whether any track crossed its dwell threshold
    /// this frame.
    fn update_dwell(&mut self, now: f64, snapshot: &StateSnapshot) -> bool {
        let Some(roi) = &self.rules.roi else {
            return false;
        };
        let mut fired = false;

        for (&track_id, &in_roi) in &snapshot.roi_membership {
            if in_roi {
                let state = self.dwell.entry(track_id).or_insert(DwellState {
                    entered_at: now,
                    alerted: false,
                });
                if !state.alerted && now - state.entered_at > roi.dwell_time_threshold {
                    warn!(
                        "track {} dwelled in the ROI for more than {} s",
                        track_id, roi.dwell_time_threshold
                    );
                    state.alerted = true;
                    fired = true;
                }
            } else {
                self.dwell.remove(&track_id);
            }
        }

        let current_ids: HashSet<TrackId> =
            snapshot.tracks.iter().map(|t| t.id).collect();
        self.dwell.retain(|id, _| current_ids.contains(id));
        fired
    }

    /// What the highest-priority currently-active trigger is, for the
    /// successor event after a duration split.
    fn currently_active_kind(&self, snapshot: &StateSnapshot) -> EventKind {
        if !self.active_alert_ids.is_empty() {
            return EventKind::TripwireAlert;
        }
        let dwelling = self.dwell.iter().any(|(id, state)| {
            state.alerted && snapshot.roi_membership.get(id).copied().unwrap_or(false)
        });
        if dwelling {
            EventKind::DwellAlert
        } else {
            EventKind::PersonDetected
        }
    }

    fn finish_event(&mut self, reason: EndReason, now: f64, snapshot: &StateSnapshot) {
        let reason_text = match reason {
            EndReason::PersonGone => "person left",
            EndReason::DurationCap => "maximum duration reached",
            EndReason::QueueEmpty => "frame queue drained",
        };
        info!("event finished ({reason_text})");

        let recording = std::mem::take(&mut self.recording);
        let features = std::mem::take(&mut self.event_features);

        // Segmentation: a duration-capped event continues as a new one
        // seeded with the previous recording's tail. The tracker session
        // and alert state carry across the split.
        let successor = if reason == EndReason::DurationCap {
            let cap = self.ring.capacity();
            let tail_start = recording.len().saturating_sub(cap);
            Some(recording[tail_start..].to_vec())
        } else {
            None
        };

        self.hand_off(recording, features, reason);

        match successor {
            Some(seed) => {
                self.event_kind = self.currently_active_kind(snapshot);
                info!(
                    "continuing as a new '{}' event ({} seed frame(s))",
                    self.event_kind,
                    seed.len()
                );
                self.recording = seed;
                self.event_start = now;
            }
            None => {
                self.capturing = false;
                self.event_kind = EventKind::PersonDetected;
                self.last_event_end = now;
                self.shared.set_event_ended();
            }
        }
    }

    fn hand_off(&self, recording: Vec<RecordedFrame>, features: Vec<FeatureVec>, reason: EndReason) {
        if recording.len() < 2 {
            debug!("discarding recording with {} frame(s)", recording.len());
            return;
        }
        let t_first = recording[0].frame.timestamp;
        let t_last = recording[recording.len() - 1].frame.timestamp;
        let duration = t_last - t_first;
        if duration <= 0.0 {
            debug!("discarding recording with non-positive duration");
            return;
        }
        let observed_fps = recording.len() as f64 / duration;
        let person_gone_at = match reason {
            EndReason::PersonGone | EndReason::QueueEmpty => Some(self.last_person_seen),
            EndReason::DurationCap => None,
        };
        self.submitter.submit(ClipJob {
            frames: recording,
            kind: self.event_kind,
            features,
            observed_fps,
            event_start: self.event_start,
            person_gone_at,
        });
    }
}
