//! Shared data model for the vigil pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub mod geom;

use geom::Point;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image buffer length {got} does not match {width}x{height} BGR8 ({expected})")]
    BadImageLength {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
    #[error("feature blob length {0} is not a multiple of 4")]
    BadFeatureLength(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw BGR8 image data, row-major.
///
/// `stride` is the number of bytes in an image row. All images produced by
/// the decoder are tightly packed (`stride == width * 3`), but operations
/// read through `stride` so sub-images stay cheap.
#[derive(Clone, PartialEq)]
pub struct BgrImage {
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
    /// number of bytes in an image row
    pub stride: usize,
    /// raw image data
    pub data: Vec<u8>,
}

impl BgrImage {
    /// Allocate a black image.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * 3;
        Self {
            width,
            height,
            stride,
            data: vec![0u8; stride * height as usize],
        }
    }

    /// Wrap a tightly packed BGR8 buffer.
    pub fn from_packed(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(Error::BadImageLength {
                width,
                height,
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            stride: width as usize * 3,
            data,
        })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let off = y as usize * self.stride + x as usize * 3;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let off = y as usize * self.stride + x as usize * 3;
        self.data[off] = bgr[0];
        self.data[off + 1] = bgr[1];
        self.data[off + 2] = bgr[2];
    }
}

impl std::fmt::Debug for BgrImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgrImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// A decoded frame with its monotonic capture time.
///
/// The pixel buffer is shared by reference; cloning a `Frame` never copies
/// image data.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Seconds since pipeline start (monotonic clock).
    pub timestamp: f64,
    pub image: Arc<BgrImage>,
}

impl Frame {
    pub fn new(timestamp: f64, image: BgrImage) -> Self {
        Self {
            timestamp,
            image: Arc::new(image),
        }
    }
}

/// Stable per-session track identifier. Never reused within one tracker
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned box in analysis-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectF {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RectF {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// The point used for all behavior geometry: the middle of the box's
    /// bottom edge (where the feet are).
    pub fn bottom_center(&self) -> Point {
        Point {
            x: (self.x1 + self.x2) as f64 / 2.0,
            y: self.y2 as f64,
        }
    }

    pub fn intersection_over_union(&self, other: &RectF) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let inter = iw * ih;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One tracked person in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub bbox: RectF,
    pub confidence: f32,
}

/// Event classification, ordered by priority. An event's kind only ever
/// moves up this ordering during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    PersonDetected,
    DwellAlert,
    TripwireAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PersonDetected => "person_detected",
            EventKind::DwellAlert => "dwell_alert",
            EventKind::TripwireAlert => "tripwire_alert",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "person_detected" => Ok(EventKind::PersonDetected),
            "dwell_alert" => Ok(EventKind::DwellAlert),
            "tripwire_alert" => Ok(EventKind::TripwireAlert),
            other => Err(format!("unknown event type \"{other}\"")),
        }
    }
}

/// An appearance feature vector produced by the Re-ID extractor.
///
/// The dimension is whatever the extractor produces and is constant per
/// deployment. Persisted as little-endian `f32` bytes; the round trip is
/// bit-exact.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVec(Vec<f32>);

impl FeatureVec {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Byte serialization used both for storage and for byte-identity
    /// deduplication.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.0.len() * 4];
        LittleEndian::write_f32_into(&self.0, &mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::BadFeatureLength(bytes.len()));
        }
        let mut values = vec![0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(bytes, &mut values);
        Ok(Self(values))
    }

    /// Cosine similarity. Zero-norm inputs compare as 0.0.
    pub fn cosine_similarity(&self, other: &FeatureVec) -> f32 {
        let mut dot = 0.0f64;
        let mut na = 0.0f64;
        let mut nb = 0.0f64;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += *a as f64 * *b as f64;
            na += *a as f64 * *a as f64;
            nb += *b as f64 * *b as f64;
        }
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        (dot / (na.sqrt() * nb.sqrt())) as f32
    }

    /// Element-wise sum, used by neighbor-feature centralization.
    pub fn add_assign(&mut self, other: &FeatureVec) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += *b;
        }
    }
}

/// One frame of an event recording, together with the analytics snapshot
/// that was current when it was routed.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub frame: Frame,
    pub tracks: Arc<Vec<Track>>,
    pub roi_membership: HashMap<TrackId, bool>,
    pub alert_ids: HashSet<TrackId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_blob_round_trip_is_bit_exact() {
        let orig = FeatureVec::new(vec![0.25, -1.5, 3.0e-8, f32::MIN_POSITIVE, 1234.5678]);
        let bytes = orig.to_bytes();
        let back = FeatureVec::from_bytes(&bytes).unwrap();
        assert_eq!(orig, back);
        assert_eq!(bytes, back.to_bytes());
    }

    #[test]
    fn feature_blob_rejects_ragged_length() {
        assert!(FeatureVec::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let z = FeatureVec::new(vec![0.0; 4]);
        let v = FeatureVec::new(vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(z.cosine_similarity(&v), 0.0);
    }

    #[test]
    fn cosine_basics() {
        use approx::assert_relative_eq;
        let a = FeatureVec::new(vec![1.0, 0.0]);
        let b = FeatureVec::new(vec![0.0, 1.0]);
        let c = FeatureVec::new(vec![2.0, 0.0]);
        assert_relative_eq!(a.cosine_similarity(&b), 0.0);
        assert_relative_eq!(a.cosine_similarity(&c), 1.0);
        assert_relative_eq!(a.cosine_similarity(&a), 1.0);
    }

    #[test]
    fn event_kind_priority_is_monotonic() {
        assert!(EventKind::PersonDetected < EventKind::DwellAlert);
        assert!(EventKind::DwellAlert < EventKind::TripwireAlert);
    }

    #[test]
    fn event_kind_string_round_trip() {
        for kind in [
            EventKind::PersonDetected,
            EventKind::DwellAlert,
            EventKind::TripwireAlert,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("burglar_alert".parse::<EventKind>().is_err());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = RectF {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let b = RectF {
            x1: 20.0,
            y1: 20.0,
            x2: 30.0,
            y2: 30.0,
        };
        assert_eq!(a.intersection_over_union(&b), 0.0);
        assert_eq!(a.intersection_over_union(&a), 1.0);
    }

    #[test]
    fn bottom_center_is_feet_point() {
        let r = RectF {
            x1: 10.0,
            y1: 0.0,
            x2: 20.0,
            y2: 50.0,
        };
        let p = r.bottom_center();
        assert_eq!(p.x, 15.0);
        assert_eq!(p.y, 50.0);
    }

    #[test]
    fn packed_image_length_is_checked() {
        assert!(BgrImage::from_packed(4, 4, vec![0u8; 4 * 4 * 3]).is_ok());
        assert!(BgrImage::from_packed(4, 4, vec![0u8; 17]).is_err());
    }
}
