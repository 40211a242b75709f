//! The per-event tail: decimate, annotate, compress, reconcile, persist,
//! notify.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use rusttype::Font;
use tracing::{error, info, warn};

use vigil_config_data::{BehaviorRules, FpsMode};
use vigil_store::Store;
use vigil_types::{EventKind, RecordedFrame};

use crate::overlay::{self, FramePhase};
use crate::{ClipJob, Notifier, Result, SinkFactory};

/// Everything an encode worker needs, shared by all workers.
pub struct ClipContext {
    pub output_dir: PathBuf,
    pub database: PathBuf,
    pub rules: BehaviorRules,
    pub fps_mode: FpsMode,
    pub target_fps: f64,
    pub encode_width: u32,
    pub encode_height: u32,
    pub analysis_width: u32,
    pub analysis_height: u32,
    pub post_event_seconds: f64,
    pub intra_event_threshold: f32,
    pub person_match_threshold: f32,
    pub sink_factory: Arc<dyn SinkFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub font: Font<'static>,
}

/// Apply the fps policy: in `target` mode recordings faster than the
/// target are thinned by plain decimation. Returns the surviving frames
/// and the rate to declare on the container.
pub fn sample_frames(
    frames: Vec<RecordedFrame>,
    observed_fps: f64,
    mode: FpsMode,
    target_fps: f64,
) -> (Vec<RecordedFrame>, f64) {
    if mode == FpsMode::Target && observed_fps > target_fps && target_fps > 0.0 {
        let step = (observed_fps / target_fps).round().max(1.0) as usize;
        let sampled: Vec<RecordedFrame> = frames.into_iter().step_by(step).collect();
        (sampled, observed_fps / step as f64)
    } else {
        (frames, observed_fps)
    }
}

/// Pick `<event_type>_<YYYY-MM-DD_HH-MM-SS>[-N].mp4` inside `dir`,
/// suffixing a counter when several events finish within one second.
pub fn allocate_clip_path(
    dir: &Path,
    kind: EventKind,
    now: chrono::DateTime<Local>,
) -> PathBuf {
    let stamp = now.format("%Y-%m-%d_%H-%M-%S");
    let base = format!("{}_{stamp}", kind.as_str());
    let mut candidate = dir.join(format!("{base}.mp4"));
    let mut counter = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{base}-{counter}.mp4"));
        counter += 1;
    }
    candidate
}

fn phase_of(
    frame: &RecordedFrame,
    event_start: f64,
    person_gone_at: Option<f64>,
    post_event_seconds: f64,
) -> FramePhase {
    let t = frame.frame.timestamp;
    if t < event_start {
        FramePhase::Pre {
            seconds_until_event: event_start - t,
        }
    } else if let Some(gone) = person_gone_at {
        if t > gone {
            FramePhase::Post {
                seconds_left: post_event_seconds - (t - gone),
            }
        } else {
            FramePhase::During
        }
    } else {
        FramePhase::During
    }
}

/// Run one job to completion. Encode failure discards the partial file
/// and commits nothing; Re-ID failure still persists the event row with
/// no identity.
pub fn process_job(job: ClipJob, ctx: &ClipContext) -> Result<()> {
    let ClipJob {
        frames,
        kind,
        features,
        observed_fps,
        event_start,
        person_gone_at,
    } = job;
    if frames.len() < 2 || observed_fps <= 0.0 {
        warn!("discarding degenerate recording ({} frames)", frames.len());
        return Ok(());
    }

    let (frames, output_fps) = sample_frames(frames, observed_fps, ctx.fps_mode, ctx.target_fps);
    info!(
        "encoding {} frame(s) at {:.2} fps (event type: {})",
        frames.len(),
        output_fps,
        kind
    );

    let now = Local::now();
    let path = allocate_clip_path(&ctx.output_dir, kind, now);
    let scale_x = ctx.encode_width as f64 / ctx.analysis_width as f64;
    let scale_y = ctx.encode_height as f64 / ctx.analysis_height as f64;

    let encode_started = std::time::Instant::now();
    let encode_result = (|| {
        let mut sink = ctx.sink_factory.create(&path, output_fps)?;
        for rec in &frames {
            let mut img = (*rec.frame.image).clone();
            overlay::render(
                &mut img,
                rec,
                &ctx.rules,
                scale_x,
                scale_y,
                phase_of(rec, event_start, person_gone_at, ctx.post_event_seconds),
                &ctx.font,
            );
            sink.write_frame(&img)?;
        }
        sink.finish()
    })();

    if let Err(e) = encode_result {
        // Partial output is worthless; nothing downstream happens either
        // (no event row, no gallery commit, no notification).
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }
    let encode_secs = encode_started.elapsed().as_secs_f64();
    let encode_fps = if encode_secs > 0.0 {
        frames.len() as f64 / encode_secs
    } else {
        0.0
    };
    info!(
        "clip saved to {} ({:.2} s, {:.1} fps encode rate)",
        path.display(),
        encode_secs,
        encode_fps
    );

    let mut store = Store::open(&ctx.database)?;
    let person_id = vigil_reid::assign_event_person(
        &mut store,
        features,
        ctx.intra_event_threshold,
        ctx.person_match_threshold,
        now,
    );

    let path_str = path.to_string_lossy();
    match store.insert_event(now, kind, &path_str, person_id) {
        Ok(event_id) => info!("event {} recorded (person: {:?})", event_id, person_id),
        Err(e) => {
            // The clip exists on disk; losing only the row is the least
            // bad outcome, so log and carry on to the notification.
            error!("failed to persist event row: {e}");
        }
    }

    let message = format!(
        "Event alert ({})\nActivity detected at {}.\nClip: {}p @ {:.1} FPS, encode rate {:.1} FPS",
        kind,
        now.format("%Y-%m-%d %H:%M:%S"),
        ctx.encode_height,
        output_fps,
        encode_fps,
    );
    ctx.notifier.notify(&message, Some(&path));

    Ok(())
}
