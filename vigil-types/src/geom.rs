//! Small 2-D geometry kit for behavior rules.
//!
//! All coordinates are analysis-resolution pixels in the usual screen
//! orientation (y grows downward). The side convention below is stated for
//! that orientation.

use serde::{Deserialize, Serialize};

/// Values within this distance of a line count as "on" it and never
/// produce a crossing.
const SIDE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Which side of a directed line a point lies on, looking along the line's
/// direction with y downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
    On,
}

/// Signed-area side test for `p` against the directed line `a -> b`.
///
/// Collinear points (within tolerance) report `Side::On`.
pub fn side_of_line(p: Point, a: Point, b: Point) -> Side {
    let val = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if val > SIDE_TOLERANCE {
        Side::Right
    } else if val < -SIDE_TOLERANCE {
        Side::Left
    } else {
        Side::On
    }
}

fn orientation(a: Point, b: Point, c: Point) -> Side {
    side_of_line(c, a, b)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.x >= a.x.min(b.x) - SIDE_TOLERANCE
        && p.x <= a.x.max(b.x) + SIDE_TOLERANCE
        && p.y >= a.y.min(b.y) - SIDE_TOLERANCE
        && p.y <= a.y.max(b.y) + SIDE_TOLERANCE
}

/// Whether segments `p1-p2` and `q1-q2` intersect. Endpoint touching
/// counts as an intersection; the caller decides whether ties trigger.
pub fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let o1 = orientation(p1, p2, q1);
    let o2 = orientation(p1, p2, q2);
    let o3 = orientation(q1, q2, p1);
    let o4 = orientation(q1, q2, p2);

    if o1 != o2 && o3 != o4 && o1 != Side::On && o2 != Side::On && o3 != Side::On && o4 != Side::On
    {
        return true;
    }

    // Collinear or touching cases.
    (o1 == Side::On && on_segment(p1, p2, q1))
        || (o2 == Side::On && on_segment(p1, p2, q2))
        || (o3 == Side::On && on_segment(q1, q2, p1))
        || (o4 == Side::On && on_segment(q1, q2, p2))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<Point>,
}

#[derive(Debug, thiserror::Error)]
#[error("a polygon needs at least 3 points, got {0}")]
pub struct PolygonError(pub usize);

impl Polygon {
    pub fn new(points: Vec<Point>) -> Result<Self, PolygonError> {
        if points.len() < 3 {
            return Err(PolygonError(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Even-odd (crossing rule) containment test.
    pub fn contains(&self, p: Point) -> bool {
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];
            if ((pi.y > p.y) != (pj.y > p.y))
                && (p.x < (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x)
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}
