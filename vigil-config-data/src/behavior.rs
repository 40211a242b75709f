//! Behavior rules: one optional ROI polygon with a dwell threshold, plus
//! any number of directed tripwires.
//!
//! Loading is lenient at the section level: a missing file or an invalid
//! section disables that feature with a warning instead of refusing to
//! start.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vigil_types::geom::{Point, Polygon};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDirection {
    /// Trigger when the track moves from the line's right side to its
    /// left side (looking along the segment's direction, y down).
    CrossToLeft,
    /// Trigger when the track moves from the left side to the right side.
    CrossToRight,
    Both,
}

#[derive(Debug, Clone)]
pub struct RoiRule {
    pub polygon: Polygon,
    /// Seconds a track must continuously stay inside before a dwell alert.
    pub dwell_time_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct TripwireRule {
    pub a: Point,
    pub b: Point,
    pub direction: CrossDirection,
}

/// Precompiled behavior rules, ready for per-frame geometry tests.
#[derive(Debug, Clone, Default)]
pub struct BehaviorRules {
    pub roi: Option<RoiRule>,
    pub tripwires: Vec<TripwireRule>,
}

fn default_dwell_time_threshold() -> f64 {
    3.0
}

fn default_alert_direction() -> CrossDirection {
    CrossDirection::Both
}

#[derive(Debug, Default, Deserialize)]
struct RawBehaviorFile {
    #[serde(default)]
    roi: Option<RawRoiSection>,
    #[serde(default)]
    tripwires: Option<RawTripwireSection>,
}

#[derive(Debug, Deserialize)]
struct RawRoiSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    polygon_points: Vec<[f64; 2]>,
    #[serde(default = "default_dwell_time_threshold")]
    dwell_time_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct RawTripwireSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    lines: Vec<RawTripwireLine>,
}

#[derive(Debug, Deserialize)]
struct RawTripwireLine {
    points: Vec<[f64; 2]>,
    #[serde(default = "default_alert_direction")]
    alert_direction: CrossDirection,
}

fn compile(raw: RawBehaviorFile) -> BehaviorRules {
    let mut rules = BehaviorRules::default();

    if let Some(roi) = raw.roi {
        if roi.enabled {
            let points: Vec<Point> = roi
                .polygon_points
                .iter()
                .map(|[x, y]| Point::new(*x, *y))
                .collect();
            match Polygon::new(points) {
                Ok(polygon) => {
                    info!(
                        "loaded ROI polygon with {} points, dwell threshold {} s",
                        polygon.points().len(),
                        roi.dwell_time_threshold
                    );
                    rules.roi = Some(RoiRule {
                        polygon,
                        dwell_time_threshold: roi.dwell_time_threshold,
                    });
                }
                Err(e) => {
                    warn!("ROI enabled but unusable ({e}); ROI analysis disabled");
                }
            }
        }
    }

    if let Some(tw) = raw.tripwires {
        if tw.enabled {
            for line in tw.lines {
                if line.points.len() != 2 {
                    warn!(
                        "skipping tripwire definition with {} points (need exactly 2)",
                        line.points.len()
                    );
                    continue;
                }
                rules.tripwires.push(TripwireRule {
                    a: Point::new(line.points[0][0], line.points[0][1]),
                    b: Point::new(line.points[1][0], line.points[1][1]),
                    direction: line.alert_direction,
                });
            }
            if !rules.tripwires.is_empty() {
                info!("loaded {} tripwire(s)", rules.tripwires.len());
            }
        }
    }

    rules
}

/// Load behavior rules from a YAML file.
///
/// A missing or unparsable file yields empty rules (everything disabled)
/// with a warning, matching the behavior-analysis loader this replaces.
pub fn load_behavior_file<P: AsRef<Path>>(path: P) -> Result<BehaviorRules> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(
            "behavior config {} not found; ROI and tripwire analysis disabled",
            path.display()
        );
        return Ok(BehaviorRules::default());
    }
    let buf = std::fs::read_to_string(path)?;
    let raw: RawBehaviorFile = match serde_yaml::from_str(&buf) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                "behavior config {} failed to parse ({e}); ROI and tripwire analysis disabled",
                path.display()
            );
            return Ok(BehaviorRules::default());
        }
    };
    Ok(compile(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
roi:
  enabled: true
  polygon_points: [[640, 200], [1280, 200], [1280, 720], [640, 720]]
  dwell_time_threshold: 3.0
tripwires:
  enabled: true
  lines:
    - points: [[300, 600], [1000, 600]]
      alert_direction: "cross_to_right"
    - points: [[100, 100], [100, 700]]
"#;

    #[test]
    fn full_file_compiles_both_rule_kinds() {
        let raw: RawBehaviorFile = serde_yaml::from_str(FULL).unwrap();
        let rules = compile(raw);
        let roi = rules.roi.expect("roi");
        assert_eq!(roi.polygon.points().len(), 4);
        assert_eq!(roi.dwell_time_threshold, 3.0);
        assert_eq!(rules.tripwires.len(), 2);
        assert_eq!(rules.tripwires[0].direction, CrossDirection::CrossToRight);
        assert_eq!(rules.tripwires[1].direction, CrossDirection::Both);
    }

    #[test]
    fn disabled_sections_yield_no_rules() {
        let yaml = r#"
roi:
  enabled: false
  polygon_points: [[0, 0], [10, 0], [10, 10]]
tripwires:
  enabled: false
  lines:
    - points: [[0, 0], [5, 5]]
"#;
        let rules = compile(serde_yaml::from_str(yaml).unwrap());
        assert!(rules.roi.is_none());
        assert!(rules.tripwires.is_empty());
    }

    #[test]
    fn degenerate_roi_is_disabled_not_fatal() {
        let yaml = r#"
roi:
  enabled: true
  polygon_points: [[0, 0], [10, 10]]
"#;
        let rules = compile(serde_yaml::from_str(yaml).unwrap());
        assert!(rules.roi.is_none());
    }

    #[test]
    fn tripwire_with_wrong_point_count_is_skipped() {
        let yaml = r#"
tripwires:
  enabled: true
  lines:
    - points: [[0, 0], [5, 5], [9, 9]]
    - points: [[0, 0], [5, 5]]
"#;
        let rules = compile(serde_yaml::from_str(yaml).unwrap());
        assert_eq!(rules.tripwires.len(), 1);
    }

    #[test]
    fn missing_file_disables_analysis() {
        let rules = load_behavior_file("/nonexistent/behavior.yaml").unwrap();
        assert!(rules.roi.is_none());
        assert!(rules.tripwires.is_empty());
    }
}
