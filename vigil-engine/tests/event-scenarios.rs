//! End-to-end scenarios for the event state machine, driven by scripted
//! analytics snapshots at a fixed frame rate.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crossbeam_channel::unbounded;

use clip_writer::{ClipJob, ClipSubmitter};
use vigil_config_data::{BehaviorRules, CrossDirection, RoiRule, TripwireRule};
use vigil_engine::{EventStateMachine, SharedStore, SmConfig, StateSnapshot};
use vigil_types::geom::{Point, Polygon};
use vigil_types::{BgrImage, EventKind, Frame, RectF, Track, TrackId};

const FPS: f64 = 10.0;
const DT: f64 = 1.0 / FPS;

#[derive(Default)]
struct CollectingSubmitter {
    jobs: Mutex<Vec<ClipJob>>,
}

impl ClipSubmitter for CollectingSubmitter {
    fn submit(&self, job: ClipJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

fn base_config() -> SmConfig {
    SmConfig {
        pre_event_seconds: 2.0,
        post_event_seconds: 5.0,
        cooldown_period: 5.0,
        max_event_duration: 20.0,
        target_fps: FPS,
    }
}

fn machine(
    rules: BehaviorRules,
    cfg: SmConfig,
) -> (EventStateMachine, Arc<CollectingSubmitter>, SharedStore) {
    let (_tx, rx) = unbounded();
    let shared = SharedStore::new();
    let submitter = Arc::new(CollectingSubmitter::default());
    let sm = EventStateMachine::new(rx, shared.clone(), rules, cfg, submitter.clone());
    (sm, submitter, shared)
}

/// A person standing at `(x, y)` (bottom-center, analysis pixels).
fn person(id: u32, x: f64, y: f64) -> (u32, f64, f64) {
    (id, x, y)
}

fn snapshot_for(people: &[(u32, f64, f64)], roi: Option<&Polygon>) -> StateSnapshot {
    let tracks: Vec<Track> = people
        .iter()
        .map(|&(id, x, y)| Track {
            id: TrackId(id),
            bbox: RectF {
                x1: (x - 5.0) as f32,
                y1: (y - 20.0) as f32,
                x2: (x + 5.0) as f32,
                y2: y as f32,
            },
            confidence: 0.9,
        })
        .collect();
    let mut roi_membership = HashMap::new();
    if let Some(poly) = roi {
        for track in &tracks {
            roi_membership.insert(track.id, poly.contains(track.bbox.bottom_center()));
        }
    }
    StateSnapshot {
        person_present: !tracks.is_empty(),
        tracks: Arc::new(tracks),
        roi_membership,
        reid_features: HashMap::new(),
        frame_seq: 0,
    }
}

/// Drive frames for `[t0, t1)`; `script` maps a timestamp to the people
/// visible in that frame.
fn drive(
    sm: &mut EventStateMachine,
    t0: f64,
    t1: f64,
    roi: Option<&Polygon>,
    script: impl Fn(f64) -> Vec<(u32, f64, f64)>,
) {
    let steps = ((t1 - t0) / DT).round() as usize;
    for i in 0..steps {
        let t = t0 + i as f64 * DT;
        let snapshot = snapshot_for(&script(t), roi);
        sm.process_frame(Frame::new(t, BgrImage::new(4, 4)), &snapshot);
    }
}

fn roi_square() -> Polygon {
    Polygon::new(vec![
        Point::new(100.0, 100.0),
        Point::new(200.0, 100.0),
        Point::new(200.0, 200.0),
        Point::new(100.0, 200.0),
    ])
    .unwrap()
}

#[test]
fn plain_person_event_with_pre_and_post_context() {
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), base_config());

    // Nobody until t=3, a person until t=8, then empty until t=16.
    drive(&mut sm, 0.0, 16.0, None, |t| {
        if (3.0..8.0).contains(&t) {
            vec![person(1, 50.0, 50.0)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.kind, EventKind::PersonDetected);

    let t_first = job.frames[0].frame.timestamp;
    let t_last = job.frames[job.frames.len() - 1].frame.timestamp;
    assert!(job.frames.len() >= 2);
    assert!(t_last > t_first);
    // Pre-roll (ring holds up to 1.5x pre_event_seconds), activity, and
    // the post-event debounce: about 3 + 5 + 5 seconds at these settings.
    let duration = t_last - t_first;
    assert!((11.0..=14.0).contains(&duration), "duration was {duration}");
    // Seeded context starts before the person appeared.
    assert!(t_first < 3.0);
    // The machine saw the absence debounce expire shortly after t=13.
    assert!((12.9..=13.5).contains(&t_last), "t_last was {t_last}");
    let gone = job.person_gone_at.expect("ended by absence");
    assert!((gone - 7.9).abs() < 1e-6);
}

#[test]
fn no_person_means_no_event() {
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), base_config());
    drive(&mut sm, 0.0, 30.0, None, |_| vec![]);
    sm.on_queue_empty();
    assert!(submitter.jobs.lock().unwrap().is_empty());
}

#[test]
fn empty_start_and_stop_produces_nothing() {
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), base_config());
    sm.on_queue_empty();
    let stop = AtomicBool::new(true);
    sm.run(&stop);
    assert!(submitter.jobs.lock().unwrap().is_empty());
}

#[test]
fn dwell_elevates_the_event_after_the_threshold() {
    let poly = roi_square();
    let rules = BehaviorRules {
        roi: Some(RoiRule {
            polygon: poly.clone(),
            dwell_time_threshold: 3.0,
        }),
        tripwires: vec![],
    };
    let (mut sm, submitter, _) = machine(rules, base_config());

    // In the ROI from t=2 to t=10, then gone.
    drive(&mut sm, 0.0, 16.0, Some(&poly), |t| {
        if (2.0..10.0).contains(&t) {
            vec![person(1, 150.0, 150.0)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, EventKind::DwellAlert);
}

#[test]
fn dwell_requires_strictly_more_than_the_threshold() {
    let poly = roi_square();
    let rules = BehaviorRules {
        roi: Some(RoiRule {
            polygon: poly.clone(),
            dwell_time_threshold: 3.0,
        }),
        tripwires: vec![],
    };
    let (mut sm, submitter, _) = machine(rules, base_config());

    // Inside the ROI for exactly the threshold: frames t=2.0 ..= 5.0.
    drive(&mut sm, 0.0, 14.0, Some(&poly), |t| {
        if (2.0..=5.0).contains(&t) {
            vec![person(1, 150.0, 150.0)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    // Never elevated: the dwell clock only exceeds 3.0 s after the
    // person has already left.
    assert_eq!(jobs[0].kind, EventKind::PersonDetected);
}

fn tripwire_rules(direction: CrossDirection) -> BehaviorRules {
    BehaviorRules {
        roi: None,
        // A horizontal wire; walking downward crosses left-to-right. The
        // half-pixel offset keeps sampled positions off the line itself.
        tripwires: vec![TripwireRule {
            a: Point::new(10.0, 100.5),
            b: Point::new(300.0, 100.5),
            direction,
        }],
    }
}

#[test]
fn admitted_tripwire_crossing_raises_the_alert() {
    let (mut sm, submitter, _) = machine(
        tripwire_rules(CrossDirection::CrossToRight),
        base_config(),
    );

    // Appear at t=1 above the wire, walk downward through it around t=4,
    // keep walking, leave at t=8.
    drive(&mut sm, 0.0, 16.0, None, |t| {
        if (1.0..8.0).contains(&t) {
            let y = 70.0 + (t - 1.0) * 10.0; // crosses y=100.5 just after t=4
            vec![person(1, 150.0, y)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.kind, EventKind::TripwireAlert);
    // The crossing frame carries the alerted track id.
    let alerted: Vec<_> = job
        .frames
        .iter()
        .filter(|f| f.alert_ids.contains(&TrackId(1)))
        .collect();
    assert!(!alerted.is_empty());
    assert!(alerted[0].frame.timestamp > 3.9 && alerted[0].frame.timestamp < 4.3);
}

#[test]
fn wrong_direction_crossing_is_ignored() {
    let (mut sm, submitter, _) = machine(
        tripwire_rules(CrossDirection::CrossToRight),
        base_config(),
    );

    // Walk upward through the wire: a right-to-left crossing, which this
    // wire does not admit.
    drive(&mut sm, 0.0, 16.0, None, |t| {
        if (1.0..8.0).contains(&t) {
            let y = 130.0 - (t - 1.0) * 10.0;
            vec![person(1, 150.0, y)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, EventKind::PersonDetected);
    assert!(jobs[0].frames.iter().all(|f| f.alert_ids.is_empty()));
}

#[test]
fn two_crossings_stay_one_event() {
    let (mut sm, submitter, _) = machine(tripwire_rules(CrossDirection::Both), base_config());

    // Down through the wire around t=3, back up around t=7; present the
    // whole time, so the event never closes between the crossings.
    drive(&mut sm, 0.0, 18.0, None, |t| {
        if (1.0..10.0).contains(&t) {
            let y = if t < 5.0 {
                80.0 + (t - 1.0) * 10.0 // crosses downward at t=3
            } else {
                120.0 - (t - 5.0) * 10.0 // crosses upward at t=7
            };
            vec![person(1, 150.0, y)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1, "sustained presence keeps one event");
    let job = &jobs[0];
    assert_eq!(job.kind, EventKind::TripwireAlert);
    // The highlight is live again on the second crossing.
    let late_alerts = job
        .frames
        .iter()
        .any(|f| f.frame.timestamp > 6.9 && f.alert_ids.contains(&TrackId(1)));
    assert!(late_alerts);
}

#[test]
fn duration_cap_segments_into_two_events() {
    let cfg = SmConfig {
        pre_event_seconds: 0.5,
        post_event_seconds: 1.0,
        cooldown_period: 1.0,
        max_event_duration: 2.0,
        target_fps: FPS,
    };
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), cfg);

    // Person present from t=0.5 to t=3.0, then gone.
    drive(&mut sm, 0.0, 8.0, None, |t| {
        if (0.5..3.0).contains(&t) {
            vec![person(1, 50.0, 50.0)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 2);
    let first = &jobs[0];
    let second = &jobs[1];
    // The split is seeded with the predecessor's tail: the successor's
    // first frame is at (or just before) the predecessor's last.
    let first_last = first.frames.last().unwrap().frame.timestamp;
    let second_first = second.frames[0].frame.timestamp;
    assert!(second_first <= first_last);
    assert!(first_last - second_first <= 1.0);
    // A duration-capped clip has no person-gone caption budget.
    assert_eq!(first.person_gone_at, None);
    assert!(second.person_gone_at.is_some());
}

#[test]
fn cooldown_suppresses_new_events() {
    let cfg = SmConfig {
        pre_event_seconds: 1.0,
        post_event_seconds: 1.0,
        cooldown_period: 5.0,
        max_event_duration: 20.0,
        target_fps: FPS,
    };
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), cfg);

    // First visit t=1..2; event closes at about t=3.1. Second visit
    // t=4..12 falls into the cooldown window at first.
    drive(&mut sm, 0.0, 18.0, None, |t| {
        if (1.0..2.0).contains(&t) || (4.0..12.0).contains(&t) {
            vec![person(1, 50.0, 50.0)]
        } else {
            vec![]
        }
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 2);
    // The second capture only started once the cooldown had fully
    // elapsed (event end ~3.1 + cooldown 5.0).
    assert!(jobs[1].event_start > 8.0, "started {}", jobs[1].event_start);
}

#[test]
fn queue_empty_finalizes_the_active_capture() {
    let (mut sm, submitter, shared) = machine(BehaviorRules::default(), base_config());

    drive(&mut sm, 0.0, 3.0, None, |t| {
        if t >= 1.0 {
            vec![person(1, 50.0, 50.0)]
        } else {
            vec![]
        }
    });
    assert!(submitter.jobs.lock().unwrap().is_empty());

    sm.on_queue_empty();
    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    // Ending an event tells inference to reset its tracker session.
    assert!(shared.take_event_ended());
}

#[test]
fn vanished_track_loses_its_alert_highlight() {
    let (mut sm, submitter, _) = machine(tripwire_rules(CrossDirection::Both), base_config());

    // Track 1 crosses and then disappears at t=5 while track 2 keeps the
    // event alive until t=10.
    drive(&mut sm, 0.0, 18.0, None, |t| {
        let mut people = vec![];
        if (1.0..5.0).contains(&t) {
            people.push(person(1, 150.0, 80.0 + (t - 1.0) * 10.0));
        }
        if (1.0..10.0).contains(&t) {
            people.push(person(2, 40.0, 40.0));
        }
        people
    });

    let jobs = submitter.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    let after_vanish: Vec<_> = jobs[0]
        .frames
        .iter()
        .filter(|f| f.frame.timestamp >= 5.1)
        .collect();
    assert!(!after_vanish.is_empty());
    assert!(after_vanish.iter().all(|f| !f.alert_ids.contains(&TrackId(1))));
}

#[test]
fn single_frame_recordings_are_discarded() {
    // One frame with a person, then silence: the capture holds exactly
    // one frame when the queue drains, which is below the hand-off
    // minimum.
    let (mut sm, submitter, _) = machine(BehaviorRules::default(), base_config());
    let snapshot = snapshot_for(&[person(1, 50.0, 50.0)], None);
    sm.process_frame(Frame::new(0.0, BgrImage::new(4, 4)), &snapshot);
    sm.on_queue_empty();
    assert!(submitter.jobs.lock().unwrap().is_empty());
}
