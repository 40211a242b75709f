//! A bounded pool of encode workers.
//!
//! One worker per expected concurrent event; `submit` blocks once every
//! worker is busy and the queue is full, which backpressures the event
//! stage instead of spawning threads without limit.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::{error, info, warn};

use crate::job::{process_job, ClipContext};
use crate::{ClipJob, ClipSubmitter};

pub struct ClipWriterPool {
    tx: Mutex<Option<Sender<ClipJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClipWriterPool {
    pub fn new(worker_count: usize, queue_capacity: usize, ctx: Arc<ClipContext>) -> Self {
        let (tx, rx) = bounded::<ClipJob>(queue_capacity);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("clip-writer-{i}"))
                .spawn(move || {
                    // Runs until the submitting side is dropped and the
                    // queue is drained.
                    for job in rx.iter() {
                        let kind = job.kind;
                        let n = job.frames.len();
                        match process_job(job, &ctx) {
                            Ok(()) => {}
                            Err(e) => {
                                error!("{kind} clip with {n} frame(s) failed: {e}");
                            }
                        }
                    }
                })
                .expect("spawn clip-writer worker");
            workers.push(handle);
        }
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Block until every outstanding clip is finished. Always called
    /// before process exit; encode completion is never abandoned.
    pub fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());
        let mut workers = self.workers.lock().unwrap();
        let n = workers.len();
        info!("waiting for {n} encode worker(s) to drain");
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("an encode worker panicked during shutdown");
            }
        }
    }
}

impl ClipSubmitter for ClipWriterPool {
    /// Hand a recording to the pool, blocking while it is saturated.
    fn submit(&self, job: ClipJob) {
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            info!(
                "queueing {} clip with {} frame(s) for encoding",
                job.kind,
                job.frames.len()
            );
            if tx.send(job).is_err() {
                error!("encode pool is gone; recording dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameSink, Notifier, SinkFactory};
    use rusttype::Font;
    use std::path::Path;
    use std::sync::Mutex;
    use vigil_config_data::{BehaviorRules, FpsMode};
    use vigil_types::{BgrImage, EventKind, Frame, RecordedFrame};

    /// Counts frames instead of encoding them.
    struct CountingSink {
        frames: Arc<Mutex<usize>>,
    }

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, _image: &BgrImage) -> crate::Result<()> {
            *self.frames.lock().unwrap() += 1;
            Ok(())
        }
        fn finish(self: Box<Self>) -> crate::Result<()> {
            Ok(())
        }
    }

    struct CountingFactory {
        frames: Arc<Mutex<usize>>,
        clips: Arc<Mutex<Vec<std::path::PathBuf>>>,
    }

    impl SinkFactory for CountingFactory {
        fn create(&self, path: &Path, _fps: f64) -> crate::Result<Box<dyn FrameSink>> {
            // The real sink creates the file; emulate that so collision
            // suffixes keep working.
            std::fs::write(path, b"").unwrap();
            self.clips.lock().unwrap().push(path.to_path_buf());
            Ok(Box::new(CountingSink {
                frames: self.frames.clone(),
            }))
        }
    }

    struct RecordingNotifier {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str, _attachment: Option<&Path>) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn recorded(t: f64) -> RecordedFrame {
        RecordedFrame {
            frame: Frame::new(t, BgrImage::new(8, 8)),
            tracks: Arc::new(vec![]),
            roi_membership: Default::default(),
            alert_ids: Default::default(),
        }
    }

    #[test]
    fn pool_drains_all_jobs_before_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let frames = Arc::new(Mutex::new(0usize));
        let clips = Arc::new(Mutex::new(Vec::new()));
        let messages = Arc::new(Mutex::new(Vec::new()));
        let ctx = Arc::new(ClipContext {
            output_dir: dir.path().to_path_buf(),
            database: dir.path().join("events.db"),
            rules: BehaviorRules::default(),
            fps_mode: FpsMode::Source,
            target_fps: 30.0,
            encode_width: 8,
            encode_height: 8,
            analysis_width: 8,
            analysis_height: 8,
            post_event_seconds: 5.0,
            intra_event_threshold: 0.90,
            person_match_threshold: 0.96,
            sink_factory: Arc::new(CountingFactory {
                frames: frames.clone(),
                clips: clips.clone(),
            }),
            notifier: Arc::new(RecordingNotifier {
                messages: messages.clone(),
            }),
            font: Font::try_from_bytes(ttf_firacode::REGULAR as &[u8]).unwrap(),
        });

        let pool = ClipWriterPool::new(2, 4, ctx);
        for e in 0..3 {
            pool.submit(ClipJob {
                frames: (0..5).map(|i| recorded(e as f64 + i as f64 * 0.1)).collect(),
                kind: EventKind::PersonDetected,
                features: vec![],
                observed_fps: 10.0,
                event_start: e as f64,
                person_gone_at: None,
            });
        }
        pool.shutdown();

        assert_eq!(*frames.lock().unwrap(), 15);
        assert_eq!(clips.lock().unwrap().len(), 3);
        assert_eq!(messages.lock().unwrap().len(), 3);
        // Three same-second clips got distinct names.
        let names = clips.lock().unwrap();
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn degenerate_jobs_are_discarded_silently() {
        let dir = tempfile::tempdir().unwrap();
        let frames = Arc::new(Mutex::new(0usize));
        let clips = Arc::new(Mutex::new(Vec::new()));
        let ctx = Arc::new(ClipContext {
            output_dir: dir.path().to_path_buf(),
            database: dir.path().join("events.db"),
            rules: BehaviorRules::default(),
            fps_mode: FpsMode::Source,
            target_fps: 30.0,
            encode_width: 8,
            encode_height: 8,
            analysis_width: 8,
            analysis_height: 8,
            post_event_seconds: 5.0,
            intra_event_threshold: 0.90,
            person_match_threshold: 0.96,
            sink_factory: Arc::new(CountingFactory {
                frames: frames.clone(),
                clips: clips.clone(),
            }),
            notifier: Arc::new(crate::NullNotifier),
            font: Font::try_from_bytes(ttf_firacode::REGULAR as &[u8]).unwrap(),
        });
        let pool = ClipWriterPool::new(1, 2, ctx);
        pool.submit(ClipJob {
            frames: vec![recorded(0.0)],
            kind: EventKind::PersonDetected,
            features: vec![],
            observed_fps: 10.0,
            event_start: 0.0,
            person_gone_at: None,
        });
        pool.shutdown();
        assert_eq!(*frames.lock().unwrap(), 0);
        assert!(clips.lock().unwrap().is_empty());
    }
}
