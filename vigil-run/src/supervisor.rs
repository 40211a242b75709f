//! Pipeline lifecycle: wire the stages together, watch their health, and
//! take everything down cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::bounded;
use rusttype::Font;
use tracing::{error, info, warn};

use clip_writer::{ClipContext, ClipWriterPool, EncoderSettings, FfmpegSinkFactory};
use frame_feed::{run_decoder, DecoderExit, FfmpegFrameSource, FrameFanout};
use vigil_config_data::SourceKind;
use vigil_engine::tracker::GreedyIouTrackerFactory;
use vigil_engine::{
    EventStateMachine, FeatureExtractor, InferenceConfig, InferenceStage, SharedStore, SmConfig,
};

use crate::notifier;
use crate::preflight::Launch;
use crate::sidecar::SidecarAnalyzer;

/// Encode workers sized for the expected number of simultaneously
/// finishing events; submission blocks beyond queue capacity.
const ENCODE_WORKERS: usize = 2;
const ENCODE_QUEUE_CAPACITY: usize = 4;

const SUPERVISOR_TICK: Duration = Duration::from_millis(500);
/// Grace after the queues drain in file mode, long enough for the event
/// stage's poll timeout to finalize an open capture.
const FILE_DRAIN_GRACE: Duration = Duration::from_millis(2500);

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            warn!("{name} worker panicked");
        }
    } else {
        // A warning, not an abort: the process still waits for encoders.
        warn!("{name} worker did not stop within {timeout:?}");
    }
}

pub fn run_pipeline(launch: Launch) -> Result<()> {
    let Launch { config, rules } = launch;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, shutting down");
            stop.store(true, Ordering::Relaxed);
        })
        .context("installing the interrupt handler")?;
    }

    let shared = SharedStore::new();
    let (inference_tx, inference_rx) = bounded(2);
    let (event_tx, event_rx) = bounded(config.event_queue_capacity());
    // Held only for backlog inspection, never received from.
    let event_backlog = event_rx.clone();

    let font = Font::try_from_bytes(ttf_firacode::REGULAR as &[u8])
        .ok_or_else(|| anyhow!("embedded font failed to parse"))?;
    let ctx = Arc::new(ClipContext {
        output_dir: config.paths.output_dir.clone(),
        database: config.paths.database.clone(),
        rules: rules.clone(),
        fps_mode: config.video.fps_mode,
        target_fps: config.recording.target_fps,
        encode_width: config.video.encode_width,
        encode_height: config.video.encode_height,
        analysis_width: config.video.analysis_width,
        analysis_height: config.video.analysis_height,
        post_event_seconds: config.recording.post_event_seconds,
        intra_event_threshold: config.reid.intra_event_threshold,
        person_match_threshold: config.reid.person_match_threshold,
        sink_factory: Arc::new(FfmpegSinkFactory {
            settings: EncoderSettings {
                width: config.video.encode_width,
                height: config.video.encode_height,
                mode: config.video.encoding_mode,
                target_bitrate_mbps: config.video.target_bitrate_mbps,
            },
        }),
        notifier: notifier::from_config(&config.notifier),
        font,
    });
    let pool = Arc::new(ClipWriterPool::new(
        ENCODE_WORKERS,
        ENCODE_QUEUE_CAPACITY,
        ctx,
    ));

    let detector_command = config
        .analysis
        .detector_command
        .as_ref()
        .ok_or_else(|| anyhow!("detector_command vanished after preflight"))?;
    let analyzer =
        SidecarAnalyzer::spawn(detector_command).context("starting the detector sidecar")?;
    let extractor: Option<Box<dyn FeatureExtractor>> = match &config.analysis.extractor_command {
        Some(cmd) if cmd == detector_command => Some(Box::new(analyzer.extractor())),
        Some(cmd) => {
            let separate = SidecarAnalyzer::spawn(cmd).context("starting the re-id sidecar")?;
            Some(Box::new(separate.extractor()))
        }
        None => {
            info!("no extractor_command; events will carry no person identity");
            None
        }
    };

    let infer_cfg = InferenceConfig {
        analysis_width: config.video.analysis_width,
        analysis_height: config.video.analysis_height,
        reid_interval: config.analysis.reid_interval,
        feature_centralization: config.reid.feature_centralization,
        roi: rules.roi.as_ref().map(|r| r.polygon.clone()),
        ..InferenceConfig::default()
    };
    let mut inference = InferenceStage::new(
        inference_rx.clone(),
        shared.clone(),
        Box::new(analyzer.detector()),
        Box::new(GreedyIouTrackerFactory),
        extractor,
        infer_cfg,
    )
    .context("starting the inference stage")?;

    let sm_cfg = SmConfig {
        pre_event_seconds: config.recording.pre_event_seconds,
        post_event_seconds: config.recording.post_event_seconds,
        cooldown_period: config.recording.cooldown_period,
        max_event_duration: config.recording.max_event_duration,
        target_fps: config.recording.target_fps,
    };
    let mut event_sm = EventStateMachine::new(
        event_rx,
        shared.clone(),
        rules,
        sm_cfg,
        pool.clone(),
    );

    let mut source = FfmpegFrameSource::open(
        &config.source,
        config.video.encode_width,
        config.video.encode_height,
    )
    .context("starting the decoder")?;
    let mut fanout = FrameFanout::new(inference_tx, inference_rx, event_tx);

    let decoder_outcome: Arc<Mutex<Option<std::result::Result<DecoderExit, frame_feed::Error>>>> =
        Arc::new(Mutex::new(None));
    let decoder_handle = {
        let stop = stop.clone();
        let outcome = decoder_outcome.clone();
        std::thread::Builder::new()
            .name("decoder".into())
            .spawn(move || {
                let result = run_decoder(&mut source, &mut fanout, &stop);
                match &result {
                    Ok(DecoderExit::EndOfStream) => info!("decoder finished the stream"),
                    Ok(DecoderExit::Stopped) => info!("decoder stopped"),
                    Err(e) => error!("decoder died: {e}"),
                }
                *outcome.lock().unwrap() = Some(result);
            })?
    };

    let inference_handle = {
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("inference".into())
            .spawn(move || {
                if let Err(e) = inference.run(&stop) {
                    error!("inference stage failed: {e}");
                }
            })?
    };

    let event_handle = {
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("event".into())
            .spawn(move || event_sm.run(&stop))?
    };

    info!("pipeline running");
    let is_file = config.source.kind == SourceKind::File;
    let health_interval = Duration::from_secs(config.supervisor.health_check_interval_secs);
    let mut last_health_check = Instant::now();

    loop {
        std::thread::sleep(SUPERVISOR_TICK);
        if stop.load(Ordering::Relaxed) {
            break;
        }

        if decoder_handle.is_finished() {
            let clean_eof = matches!(
                *decoder_outcome.lock().unwrap(),
                Some(Ok(DecoderExit::EndOfStream))
            );
            if is_file && clean_eof {
                info!("source drained; waiting for in-flight frames");
                while !event_backlog.is_empty() && !event_handle.is_finished() {
                    std::thread::sleep(SUPERVISOR_TICK);
                }
                std::thread::sleep(FILE_DRAIN_GRACE);
            } else {
                error!("decoder worker is gone; shutting the pipeline down");
            }
            stop.store(true, Ordering::Relaxed);
            break;
        }

        if last_health_check.elapsed() >= health_interval {
            last_health_check = Instant::now();
            if inference_handle.is_finished() || event_handle.is_finished() {
                error!("a pipeline worker died; shutting the pipeline down");
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);

    let join_timeout = Duration::from_secs(config.supervisor.thread_join_timeout_secs);
    join_with_timeout(decoder_handle, join_timeout, "decoder");
    join_with_timeout(inference_handle, join_timeout, "inference");
    join_with_timeout(event_handle, join_timeout, "event");

    // Outstanding encodes always complete before exit.
    pool.shutdown();
    info!("shutdown complete");
    Ok(())
}
