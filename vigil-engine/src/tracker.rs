//! A compact greedy-IoU tracker.
//!
//! Matches each frame's detections to live tracks by best IoU, mints a
//! fresh id for everything unmatched, and retires tracks that go unseen
//! for a few frames. Ids increase monotonically and are never reused
//! within the session, which is what the event machine's alert and dwell
//! bookkeeping depends on.

use vigil_types::{BgrImage, RectF, Track, TrackId};

use crate::traits::{Detection, DynError, Tracker, TrackerFactory};

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSES: u32 = 10;

struct Live {
    id: TrackId,
    bbox: RectF,
    confidence: f32,
    misses: u32,
}

pub struct GreedyIouTracker {
    next_id: u32,
    live: Vec<Live>,
    iou_threshold: f32,
    max_misses: u32,
}

impl GreedyIouTracker {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            live: Vec::new(),
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_misses: DEFAULT_MAX_MISSES,
        }
    }
}

impl Default for GreedyIouTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker for GreedyIouTracker {
    fn update(
        &mut self,
        detections: &[Detection],
        _image: &BgrImage,
    ) -> std::result::Result<Vec<Track>, DynError> {
        let mut assigned_det = vec![false; detections.len()];
        let mut assigned_track = vec![false; self.live.len()];

        // Greedy: repeatedly take the globally best remaining pair.
        loop {
            let mut best: Option<(usize, usize, f32)> = None;
            for (ti, track) in self.live.iter().enumerate() {
                if assigned_track[ti] {
                    continue;
                }
                for (di, det) in detections.iter().enumerate() {
                    if assigned_det[di] {
                        continue;
                    }
                    let iou = track.bbox.intersection_over_union(&det.bbox);
                    if iou >= self.iou_threshold && best.map_or(true, |(_, _, b)| iou > b) {
                        best = Some((ti, di, iou));
                    }
                }
            }
            let Some((ti, di, _)) = best else { break };
            assigned_track[ti] = true;
            assigned_det[di] = true;
            self.live[ti].bbox = detections[di].bbox;
            self.live[ti].confidence = detections[di].confidence;
            self.live[ti].misses = 0;
        }

        for (ti, track) in self.live.iter_mut().enumerate() {
            if !assigned_track[ti] {
                track.misses += 1;
            }
        }
        let max_misses = self.max_misses;
        self.live.retain(|t| t.misses <= max_misses);

        for (di, det) in detections.iter().enumerate() {
            if !assigned_det[di] {
                let id = TrackId(self.next_id);
                self.next_id += 1;
                self.live.push(Live {
                    id,
                    bbox: det.bbox,
                    confidence: det.confidence,
                    misses: 0,
                });
            }
        }

        Ok(self
            .live
            .iter()
            .filter(|t| t.misses == 0)
            .map(|t| Track {
                id: t.id,
                bbox: t.bbox,
                confidence: t.confidence,
            })
            .collect())
    }
}

/// Factory producing fresh [`GreedyIouTracker`] sessions.
pub struct GreedyIouTrackerFactory;

impl TrackerFactory for GreedyIouTrackerFactory {
    fn create(&self) -> std::result::Result<Box<dyn Tracker>, DynError> {
        Ok(Box::new(GreedyIouTracker::new()))
    }
}
