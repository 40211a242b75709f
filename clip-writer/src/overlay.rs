//! Annotation rendering at encode resolution.
//!
//! Geometry comes from the analysis resolution and is scaled up by
//! `(encode / analysis)` per axis. Box color encodes the highest-priority
//! state the track is in: tripwire alert (red) over in-ROI (yellow) over
//! normal (green).

use rusttype::Font;

use imdraw::Bgr;
use vigil_config_data::{BehaviorRules, CrossDirection};
use vigil_types::{BgrImage, RecordedFrame};

const COLOR_NORMAL: Bgr = [0, 255, 0];
const COLOR_IN_ROI: Bgr = [0, 255, 255];
const COLOR_ALERT: Bgr = [0, 0, 255];
const COLOR_ROI_FILL: Bgr = [255, 255, 0];
const COLOR_TRIPWIRE: Bgr = [0, 0, 255];
const COLOR_CAPTION: Bgr = [255, 255, 255];

const ROI_FILL_ALPHA: f64 = 0.2;
const TRIPWIRE_THICKNESS: u32 = 8;
const TRIPWIRE_TIP_LENGTH: f64 = 0.02;
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 28.0;
const CAPTION_SCALE: f32 = 48.0;

/// Where a frame sits relative to the event proper, for context captions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePhase {
    /// Ring-buffer context from before the trigger.
    Pre { seconds_until_event: f64 },
    During,
    /// Person already gone; the absence debounce is running out.
    Post { seconds_left: f64 },
}

/// Draw all overlays for one recorded frame onto `img` (encode
/// resolution).
pub fn render(
    img: &mut BgrImage,
    rec: &RecordedFrame,
    rules: &BehaviorRules,
    scale_x: f64,
    scale_y: f64,
    phase: FramePhase,
    font: &Font<'_>,
) {
    if let Some(roi) = &rules.roi {
        let pts: Vec<(f64, f64)> = roi
            .polygon
            .points()
            .iter()
            .map(|p| (p.x * scale_x, p.y * scale_y))
            .collect();
        imdraw::fill_polygon(img, &pts, COLOR_ROI_FILL, ROI_FILL_ALPHA);
        let ipts: Vec<(i64, i64)> = pts
            .iter()
            .map(|(x, y)| (x.round() as i64, y.round() as i64))
            .collect();
        imdraw::draw_polyline(img, &ipts, COLOR_ROI_FILL, 4);
    }

    for wire in &rules.tripwires {
        let a = (
            (wire.a.x * scale_x).round() as i64,
            (wire.a.y * scale_y).round() as i64,
        );
        let b = (
            (wire.b.x * scale_x).round() as i64,
            (wire.b.y * scale_y).round() as i64,
        );
        match wire.direction {
            CrossDirection::CrossToRight => {
                imdraw::draw_arrow(img, a, b, COLOR_TRIPWIRE, TRIPWIRE_THICKNESS, TRIPWIRE_TIP_LENGTH)
            }
            CrossDirection::CrossToLeft => {
                imdraw::draw_arrow(img, b, a, COLOR_TRIPWIRE, TRIPWIRE_THICKNESS, TRIPWIRE_TIP_LENGTH)
            }
            CrossDirection::Both => {
                imdraw::draw_arrow(img, a, b, COLOR_TRIPWIRE, TRIPWIRE_THICKNESS, TRIPWIRE_TIP_LENGTH);
                imdraw::draw_arrow(img, b, a, COLOR_TRIPWIRE, TRIPWIRE_THICKNESS, TRIPWIRE_TIP_LENGTH);
            }
        }
    }

    for track in rec.tracks.iter() {
        let color = if rec.alert_ids.contains(&track.id) {
            COLOR_ALERT
        } else if rec.roi_membership.get(&track.id).copied().unwrap_or(false) {
            COLOR_IN_ROI
        } else {
            COLOR_NORMAL
        };
        let x1 = (track.bbox.x1 as f64 * scale_x).round() as i64;
        let y1 = (track.bbox.y1 as f64 * scale_y).round() as i64;
        let x2 = (track.bbox.x2 as f64 * scale_x).round() as i64;
        let y2 = (track.bbox.y2 as f64 * scale_y).round() as i64;
        imdraw::draw_rect(img, x1, y1, x2, y2, color, BOX_THICKNESS);
        imdraw::stamp_text(
            img,
            font,
            &format!("ID:{}", track.id),
            x1 as f64,
            (y1 - 10) as f64 - LABEL_SCALE as f64,
            LABEL_SCALE,
            color,
        );
    }

    match phase {
        FramePhase::Pre {
            seconds_until_event,
        } if seconds_until_event > 0.0 => {
            imdraw::stamp_text(
                img,
                font,
                &format!("Pre-Event Buffer: {seconds_until_event:.1}s"),
                20.0,
                20.0,
                CAPTION_SCALE,
                COLOR_CAPTION,
            );
        }
        FramePhase::Post { seconds_left } if seconds_left > 0.0 => {
            imdraw::stamp_text(
                img,
                font,
                &format!("Post-Event Buffer: {seconds_left:.1}s"),
                20.0,
                20.0,
                CAPTION_SCALE,
                COLOR_CAPTION,
            );
        }
        _ => {}
    }
}
