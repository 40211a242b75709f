//! The inference stage: consume frames, run detection / tracking /
//! Re-ID, publish one [`StateSnapshot`] per consumed frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use vigil_types::geom::Polygon;
use vigil_types::{FeatureVec, Frame, TrackId};

use crate::shared_state::SharedStore;
use crate::traits::{Detector, DynError, FeatureExtractor, TrackerFactory};
use crate::{Error, Result, Tracker};

const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_LOG_INTERVAL_FRAMES: usize = 60;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub analysis_width: u32,
    pub analysis_height: u32,
    /// Detections below this confidence are ignored.
    pub confidence_threshold: f32,
    /// At most this many detections are considered per frame.
    pub max_detections: usize,
    /// Extract Re-ID features every Nth frame.
    pub reid_interval: u64,
    pub feature_centralization: bool,
    pub roi: Option<Polygon>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            analysis_width: 1280,
            analysis_height: 736,
            confidence_threshold: 0.4,
            max_detections: 10,
            reid_interval: 5,
            feature_centralization: false,
            roi: None,
        }
    }
}

/// Outcome of one loop iteration; drives the worker loop and the tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Processed,
    TimedOut,
    Disconnected,
}

#[derive(Default)]
struct LatencyStats {
    total_ms: Vec<f64>,
    detect_ms: Vec<f64>,
    track_ms: Vec<f64>,
    reid_ms: Vec<f64>,
}

impl LatencyStats {
    fn push(&mut self, total: f64, detect: f64, track: f64, reid: f64) {
        self.total_ms.push(total);
        self.detect_ms.push(detect);
        self.track_ms.push(track);
        self.reid_ms.push(reid);
        if self.total_ms.len() >= STATS_LOG_INTERVAL_FRAMES {
            let avg = |v: &Vec<f64>| v.iter().sum::<f64>() / v.len() as f64;
            info!(
                "inference latency (avg over {} frames): total {:.1} ms | detect {:.1} ms, track {:.1} ms, re-id {:.1} ms",
                self.total_ms.len(),
                avg(&self.total_ms),
                avg(&self.detect_ms),
                avg(&self.track_ms),
                avg(&self.reid_ms),
            );
            self.total_ms.clear();
            self.detect_ms.clear();
            self.track_ms.clear();
            self.reid_ms.clear();
        }
    }
}

pub struct InferenceStage {
    rx: Receiver<Frame>,
    shared: SharedStore,
    detector: Box<dyn Detector>,
    tracker_factory: Box<dyn TrackerFactory>,
    tracker: Box<dyn Tracker>,
    extractor: Option<Box<dyn FeatureExtractor>>,
    cfg: InferenceConfig,
    frame_counter: u64,
    stats: LatencyStats,
}

impl InferenceStage {
    /// Build the stage, creating the initial tracker session. Tracker
    /// construction failure is fatal.
    pub fn new(
        rx: Receiver<Frame>,
        shared: SharedStore,
        detector: Box<dyn Detector>,
        tracker_factory: Box<dyn TrackerFactory>,
        extractor: Option<Box<dyn FeatureExtractor>>,
        cfg: InferenceConfig,
    ) -> Result<Self> {
        let tracker = tracker_factory
            .create()
            .map_err(Error::TrackerConstruction)?;
        Ok(Self {
            rx,
            shared,
            detector,
            tracker_factory,
            tracker,
            extractor,
            cfg,
            frame_counter: 0,
            stats: LatencyStats::default(),
        })
    }

    /// The worker loop. Per-frame failures are logged and skipped; only
    /// tracker re-construction can abort the stage.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!("inference stage running");
        loop {
            if stop.load(Ordering::Relaxed) {
                // Drain the short queue so the final snapshots are
                // published before the event stage finalizes.
                while let Ok(frame) = self.rx.try_recv() {
                    self.frame_counter += 1;
                    if let Err(e) = self.process_frame(&frame) {
                        error!("frame processing failed, skipping frame: {e}");
                    }
                }
                break;
            }
            match self.step(QUEUE_POLL_TIMEOUT)? {
                StepOutcome::Disconnected => break,
                StepOutcome::Processed | StepOutcome::TimedOut => {}
            }
        }
        info!("inference stage stopped");
        Ok(())
    }

    /// One loop iteration: handle session feedback, then wait for and
    /// process at most one frame.
    pub fn step(&mut self, timeout: Duration) -> Result<StepOutcome> {
        if self.shared.take_event_ended() {
            self.tracker = self
                .tracker_factory
                .create()
                .map_err(Error::TrackerConstruction)?;
            debug!("event ended; tracker session recreated");
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.frame_counter += 1;
                if let Err(e) = self.process_frame(&frame) {
                    error!("frame processing failed, skipping frame: {e}");
                }
                Ok(StepOutcome::Processed)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shared.publish_empty();
                Ok(StepOutcome::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Ok(StepOutcome::Disconnected),
        }
    }

    fn process_frame(&mut self, frame: &Frame) -> std::result::Result<(), DynError> {
        let t_capture = Instant::now();
        let analysis = imdraw::resize_bilinear(
            &frame.image,
            self.cfg.analysis_width,
            self.cfg.analysis_height,
        );

        let t_detect = Instant::now();
        let mut detections = self.detector.detect(&analysis)?;
        detections.retain(|d| d.confidence >= self.cfg.confidence_threshold);
        detections.truncate(self.cfg.max_detections);

        let t_track = Instant::now();
        let tracks = self.tracker.update(&detections, &analysis)?;

        let mut roi_membership: HashMap<TrackId, bool> = HashMap::new();
        if let Some(roi) = &self.cfg.roi {
            for track in &tracks {
                roi_membership.insert(track.id, roi.contains(track.bbox.bottom_center()));
            }
        }

        let t_reid = Instant::now();
        let mut reid_features: HashMap<TrackId, FeatureVec> = HashMap::new();
        if let Some(extractor) = &mut self.extractor {
            if !tracks.is_empty() && self.frame_counter % self.cfg.reid_interval == 0 {
                let mut ids = Vec::new();
                let mut crops = Vec::new();
                for track in &tracks {
                    if let Some(crop) = imdraw::crop(&analysis, &track.bbox) {
                        ids.push(track.id);
                        crops.push(crop);
                    }
                }
                if !crops.is_empty() {
                    let mut features = extractor.extract(&crops)?;
                    if self.cfg.feature_centralization {
                        features = vigil_reid::centralize_features(
                            &features,
                            vigil_reid::CENTRALIZE_K1,
                            vigil_reid::CENTRALIZE_K2,
                        );
                    }
                    for (id, feature) in ids.into_iter().zip(features) {
                        reid_features.insert(id, feature);
                    }
                }
            }
        }
        let t_done = Instant::now();

        let person_present = !tracks.is_empty();
        self.shared.publish(
            person_present,
            Arc::new(tracks),
            roi_membership,
            reid_features,
        );

        self.stats.push(
            (t_done - t_capture).as_secs_f64() * 1e3,
            (t_track - t_detect).as_secs_f64() * 1e3,
            (t_reid - t_track).as_secs_f64() * 1e3,
            (t_done - t_reid).as_secs_f64() * 1e3,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::GreedyIouTrackerFactory;
    use crate::traits::Detection;
    use crossbeam_channel::unbounded;
    use vigil_types::geom::Point;
    use vigil_types::{BgrImage, RectF};

    /// Emits one box whose position is scripted per call.
    struct ScriptedDetector {
        boxes: Vec<Option<RectF>>,
        call: usize,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _image: &BgrImage) -> std::result::Result<Vec<Detection>, DynError> {
            let idx = self.call.min(self.boxes.len() - 1);
            self.call += 1;
            Ok(self.boxes[idx]
                .map(|bbox| Detection {
                    bbox,
                    confidence: 0.9,
                })
                .into_iter()
                .collect())
        }
    }

    struct ConstantExtractor;

    impl FeatureExtractor for ConstantExtractor {
        fn extract(
            &mut self,
            crops: &[BgrImage],
        ) -> std::result::Result<Vec<FeatureVec>, DynError> {
            Ok(crops
                .iter()
                .map(|_| FeatureVec::new(vec![1.0, 0.0]))
                .collect())
        }
    }

    fn frame(t: f64) -> Frame {
        Frame::new(t, BgrImage::new(64, 64))
    }

    fn small_cfg(roi: Option<Polygon>) -> InferenceConfig {
        InferenceConfig {
            analysis_width: 32,
            analysis_height: 32,
            reid_interval: 5,
            roi,
            ..InferenceConfig::default()
        }
    }

    const BOX: RectF = RectF {
        x1: 4.0,
        y1: 4.0,
        x2: 12.0,
        y2: 28.0,
    };

    #[test]
    fn publishes_presence_and_roi_membership() {
        let (tx, rx) = unbounded();
        let shared = SharedStore::new();
        let roi = Polygon::new(vec![
            Point::new(0.0, 16.0),
            Point::new(32.0, 16.0),
            Point::new(32.0, 32.0),
            Point::new(0.0, 32.0),
        ])
        .unwrap();
        let mut stage = InferenceStage::new(
            rx,
            shared.clone(),
            Box::new(ScriptedDetector {
                boxes: vec![Some(BOX)],
                call: 0,
            }),
            Box::new(GreedyIouTrackerFactory),
            None,
            small_cfg(Some(roi)),
        )
        .unwrap();

        tx.send(frame(0.0)).unwrap();
        assert_eq!(stage.step(Duration::from_millis(10)).unwrap(), StepOutcome::Processed);

        let snap = shared.snapshot();
        assert!(snap.person_present);
        assert_eq!(snap.tracks.len(), 1);
        // Bottom center (8, 28) lies inside the lower-half ROI.
        assert_eq!(snap.roi_membership.get(&snap.tracks[0].id), Some(&true));
    }

    #[test]
    fn reid_runs_only_on_schedule() {
        let (tx, rx) = unbounded();
        let shared = SharedStore::new();
        let mut stage = InferenceStage::new(
            rx,
            shared.clone(),
            Box::new(ScriptedDetector {
                boxes: vec![Some(BOX)],
                call: 0,
            }),
            Box::new(GreedyIouTrackerFactory),
            Some(Box::new(ConstantExtractor)),
            small_cfg(None),
        )
        .unwrap();

        let mut with_features = Vec::new();
        for i in 0..10 {
            tx.send(frame(i as f64 * 0.1)).unwrap();
            stage.step(Duration::from_millis(10)).unwrap();
            with_features.push(!shared.snapshot().reid_features.is_empty());
        }
        // Frames are 1-indexed by the counter: the 5th and 10th carry
        // features, the rest publish empty maps.
        let expected: Vec<bool> = (1..=10).map(|i| i % 5 == 0).collect();
        assert_eq!(with_features, expected);
    }

    #[test]
    fn queue_timeout_publishes_absence() {
        let (tx, rx) = unbounded::<Frame>();
        let shared = SharedStore::new();
        let mut stage = InferenceStage::new(
            rx,
            shared.clone(),
            Box::new(ScriptedDetector {
                boxes: vec![Some(BOX)],
                call: 0,
            }),
            Box::new(GreedyIouTrackerFactory),
            None,
            small_cfg(None),
        )
        .unwrap();

        tx.send(frame(0.0)).unwrap();
        stage.step(Duration::from_millis(10)).unwrap();
        assert!(shared.snapshot().person_present);

        assert_eq!(
            stage.step(Duration::from_millis(10)).unwrap(),
            StepOutcome::TimedOut
        );
        assert!(!shared.snapshot().person_present);
    }

    #[test]
    fn event_end_feedback_recreates_the_tracker_session() {
        let (tx, rx) = unbounded();
        let shared = SharedStore::new();
        let far = RectF {
            x1: 20.0,
            y1: 20.0,
            x2: 28.0,
            y2: 30.0,
        };
        let mut stage = InferenceStage::new(
            rx,
            shared.clone(),
            Box::new(ScriptedDetector {
                boxes: vec![Some(BOX), Some(far), Some(BOX)],
                call: 0,
            }),
            Box::new(GreedyIouTrackerFactory),
            None,
            small_cfg(None),
        )
        .unwrap();

        tx.send(frame(0.0)).unwrap();
        stage.step(Duration::from_millis(10)).unwrap();
        let id0 = shared.snapshot().tracks[0].id;

        tx.send(frame(0.1)).unwrap();
        stage.step(Duration::from_millis(10)).unwrap();
        let id1 = shared.snapshot().tracks[0].id;
        assert!(id1.0 > id0.0, "disjoint box continues the same session");

        shared.set_event_ended();
        tx.send(frame(0.2)).unwrap();
        stage.step(Duration::from_millis(10)).unwrap();
        let id2 = shared.snapshot().tracks[0].id;
        assert_eq!(id2, id0, "fresh session starts its ids over");
        assert!(!shared.take_event_ended(), "feedback bit was consumed");
    }
}
