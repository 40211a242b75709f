//! BGR8 raster operations used by the analysis and encode stages: bilinear
//! resize, clamped crops, and the annotation primitives (boxes, lines,
//! arrows, translucent polygon fills, glyph stamping).
//!
//! Everything here works directly on [`BgrImage`] buffers and clips to the
//! image bounds, so callers never pre-validate coordinates.

use rusttype::{point, Font, Scale};

use vigil_types::{BgrImage, RectF};

/// A color in the image's own channel order (blue, green, red).
pub type Bgr = [u8; 3];

/// Bilinear resize to `(dst_width, dst_height)`.
pub fn resize_bilinear(src: &BgrImage, dst_width: u32, dst_height: u32) -> BgrImage {
    let mut dst = BgrImage::new(dst_width, dst_height);
    if src.width == 0 || src.height == 0 || dst_width == 0 || dst_height == 0 {
        return dst;
    }
    let x_ratio = src.width as f64 / dst_width as f64;
    let y_ratio = src.height as f64 / dst_height as f64;
    let max_x = (src.width - 1) as f64;
    let max_y = (src.height - 1) as f64;

    for dy in 0..dst_height {
        let sy = ((dy as f64 + 0.5) * y_ratio - 0.5).clamp(0.0, max_y);
        let y0 = sy.floor() as u32;
        let y1 = (y0 + 1).min(src.height - 1);
        let fy = sy - y0 as f64;
        for dx in 0..dst_width {
            let sx = ((dx as f64 + 0.5) * x_ratio - 0.5).clamp(0.0, max_x);
            let x0 = sx.floor() as u32;
            let x1 = (x0 + 1).min(src.width - 1);
            let fx = sx - x0 as f64;

            let p00 = src.pixel(x0, y0);
            let p10 = src.pixel(x1, y0);
            let p01 = src.pixel(x0, y1);
            let p11 = src.pixel(x1, y1);

            let mut out = [0u8; 3];
            for c in 0..3 {
                let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
                let bot = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
                out[c] = (top * (1.0 - fy) + bot * fy).round() as u8;
            }
            dst.put_pixel(dx, dy, out);
        }
    }
    dst
}

/// Copy out the sub-image covered by `bbox`, clamped to the image bounds.
///
/// Returns `None` when the clamped region is empty.
pub fn crop(src: &BgrImage, bbox: &RectF) -> Option<BgrImage> {
    let x1 = (bbox.x1.floor() as i64).clamp(0, src.width as i64) as u32;
    let y1 = (bbox.y1.floor() as i64).clamp(0, src.height as i64) as u32;
    let x2 = (bbox.x2.ceil() as i64).clamp(0, src.width as i64) as u32;
    let y2 = (bbox.y2.ceil() as i64).clamp(0, src.height as i64) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let (w, h) = (x2 - x1, y2 - y1);
    let mut out = BgrImage::new(w, h);
    for (row, y) in (y1..y2).enumerate() {
        let src_off = y as usize * src.stride + x1 as usize * 3;
        let dst_off = row * out.stride;
        out.data[dst_off..dst_off + w as usize * 3]
            .copy_from_slice(&src.data[src_off..src_off + w as usize * 3]);
    }
    Some(out)
}

#[inline]
fn blend_pixel(img: &mut BgrImage, x: i64, y: i64, color: Bgr, alpha: f64) {
    if x < 0 || y < 0 || x >= img.width as i64 || y >= img.height as i64 {
        return;
    }
    let (x, y) = (x as u32, y as u32);
    let old = img.pixel(x, y);
    let p = 1.0 - alpha;
    let new = [
        (old[0] as f64 * p + color[0] as f64 * alpha).round() as u8,
        (old[1] as f64 * p + color[1] as f64 * alpha).round() as u8,
        (old[2] as f64 * p + color[2] as f64 * alpha).round() as u8,
    ];
    img.put_pixel(x, y, new);
}

fn put_brush(img: &mut BgrImage, x: i64, y: i64, color: Bgr, thickness: u32) {
    let r = thickness as i64 / 2;
    for dy in -r..=r {
        for dx in -r..=r {
            blend_pixel(img, x + dx, y + dy, color, 1.0);
        }
    }
}

/// Bresenham line with a square brush of the given thickness.
pub fn draw_line(img: &mut BgrImage, p1: (i64, i64), p2: (i64, i64), color: Bgr, thickness: u32) {
    let (mut x0, mut y0) = p1;
    let (x1, y1) = p2;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put_brush(img, x0, y0, color, thickness);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// A line with an arrow head at `p2`. `tip_length` is the head size as a
/// fraction of the segment length.
pub fn draw_arrow(
    img: &mut BgrImage,
    p1: (i64, i64),
    p2: (i64, i64),
    color: Bgr,
    thickness: u32,
    tip_length: f64,
) {
    draw_line(img, p1, p2, color, thickness);
    let vx = (p1.0 - p2.0) as f64;
    let vy = (p1.1 - p2.1) as f64;
    let len = (vx * vx + vy * vy).sqrt();
    if len < 1.0 {
        return;
    }
    let tip = (len * tip_length).max(4.0);
    let angle = vy.atan2(vx);
    for side in [-1.0f64, 1.0] {
        let a = angle + side * std::f64::consts::FRAC_PI_6;
        let hx = p2.0 + (tip * a.cos()).round() as i64;
        let hy = p2.1 + (tip * a.sin()).round() as i64;
        draw_line(img, p2, (hx, hy), color, thickness);
    }
}

/// Rectangle outline.
pub fn draw_rect(
    img: &mut BgrImage,
    x1: i64,
    y1: i64,
    x2: i64,
    y2: i64,
    color: Bgr,
    thickness: u32,
) {
    draw_line(img, (x1, y1), (x2, y1), color, thickness);
    draw_line(img, (x2, y1), (x2, y2), color, thickness);
    draw_line(img, (x2, y2), (x1, y2), color, thickness);
    draw_line(img, (x1, y2), (x1, y1), color, thickness);
}

/// Closed polygon outline.
pub fn draw_polyline(img: &mut BgrImage, pts: &[(i64, i64)], color: Bgr, thickness: u32) {
    if pts.len() < 2 {
        return;
    }
    for w in pts.windows(2) {
        draw_line(img, w[0], w[1], color, thickness);
    }
    draw_line(img, pts[pts.len() - 1], pts[0], color, thickness);
}

/// Translucent polygon fill (even-odd scanline), blended into the image
/// with the given alpha.
pub fn fill_polygon(img: &mut BgrImage, pts: &[(f64, f64)], color: Bgr, alpha: f64) {
    if pts.len() < 3 {
        return;
    }
    let y_min = pts
        .iter()
        .map(|p| p.1)
        .fold(f64::INFINITY, f64::min)
        .floor()
        .max(0.0) as i64;
    let y_max = pts
        .iter()
        .map(|p| p.1)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(img.height as f64) as i64;

    for y in y_min..y_max {
        let scan = y as f64 + 0.5;
        let mut xs: Vec<f64> = Vec::new();
        let n = pts.len();
        for i in 0..n {
            let (x0, y0) = pts[i];
            let (x1, y1) = pts[(i + 1) % n];
            if (y0 > scan) != (y1 > scan) {
                xs.push(x0 + (scan - y0) / (y1 - y0) * (x1 - x0));
            }
        }
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for pair in xs.chunks_exact(2) {
            let start = pair[0].round().max(0.0) as i64;
            let end = pair[1].round().min(img.width as f64) as i64;
            for x in start..end {
                blend_pixel(img, x, y, color, alpha);
            }
        }
    }
}

/// Rasterize `text` with its baseline-left corner near `(x, y)`.
pub fn stamp_text(
    img: &mut BgrImage,
    font: &Font<'_>,
    text: &str,
    x: f64,
    y: f64,
    scale: f32,
    color: Bgr,
) {
    let scale = Scale::uniform(scale);
    let v_metrics = font.v_metrics(scale);
    let glyphs: Vec<_> = font
        .layout(text, scale, point(x as f32, y as f32 + v_metrics.ascent))
        .collect();

    for glyph in glyphs {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, v| {
                blend_pixel(
                    img,
                    gx as i64 + bb.min.x as i64,
                    gy as i64 + bb.min.y as i64,
                    color,
                    v as f64,
                );
            });
        }
    }
}
