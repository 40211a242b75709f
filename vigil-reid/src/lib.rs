//! Person re-identification: intra-event clustering, gallery
//! reconciliation, and neighbor-feature centralization.
//!
//! The clustering and reconciliation functions are pure; every database
//! mutation goes through a [`ReconcilePlan`] applied by `vigil-store` in a
//! single transaction. Reconciliation reads a snapshot of the gallery, so
//! two events finishing at the same moment can mint duplicate persons;
//! that is an accepted trade of strict de-duplication for availability.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Local};
use tracing::{info, warn};

use vigil_store::{PersonUpdate, PlanRef, ReconcilePlan, Store};
use vigil_types::FeatureVec;

/// Threshold for grouping features inside one event, distinct from the
/// gallery match threshold.
pub const DEFAULT_INTRA_EVENT_THRESHOLD: f32 = 0.90;

/// Mutual-kNN neighborhood sizes for feature centralization.
pub const CENTRALIZE_K1: usize = 2;
pub const CENTRALIZE_K2: usize = 2;

/// Drop byte-identical feature vectors, keeping first occurrences in
/// order.
pub fn dedup_features(features: Vec<FeatureVec>) -> Vec<FeatureVec> {
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut unique = Vec::with_capacity(features.len());
    for feature in features {
        if seen.insert(feature.to_bytes()) {
            unique.push(feature);
        }
    }
    unique
}

/// A nascent in-event identity. The first-added feature is the cluster's
/// representative for all comparisons.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub features: Vec<FeatureVec>,
}

impl Cluster {
    pub fn representative(&self) -> &FeatureVec {
        &self.features[0]
    }
}

/// Group an event's features: each feature joins the cluster whose
/// representative it is most similar to, if that similarity reaches
/// `intra_threshold`; otherwise it founds a new cluster. Clusters keep
/// creation order.
pub fn cluster_features(features: Vec<FeatureVec>, intra_threshold: f32) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    for feature in features {
        let mut best: Option<(usize, f32)> = None;
        for (idx, cluster) in clusters.iter().enumerate() {
            let sim = feature.cosine_similarity(cluster.representative());
            if best.map_or(true, |(_, s)| sim > s) {
                best = Some((idx, sim));
            }
        }
        match best {
            Some((idx, sim)) if sim >= intra_threshold => clusters[idx].features.push(feature),
            _ => clusters.push(Cluster {
                features: vec![feature],
            }),
        }
    }
    clusters
}

enum Candidate {
    Gallery(usize),
    New(usize),
}

/// Resolve each cluster against the gallery snapshot.
///
/// A cluster's representative is compared against every feature of every
/// candidate (two nested scans); the best person wins if its best feature
/// reaches `gallery_threshold`. Unmatched clusters become new persons and
/// immediately join the candidate set, so a later cluster can resolve to a
/// person minted earlier in the same event. Matching always uses the
/// features candidates had when they entered the set; features merged by
/// this reconciliation do not influence it.
pub fn reconcile(
    clusters: &[Cluster],
    gallery: &[vigil_store::GalleryPerson],
    gallery_threshold: f32,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    // Candidate founding features; parallel to the candidate list.
    let mut new_founding: Vec<Vec<FeatureVec>> = Vec::new();
    let mut candidates: Vec<Candidate> = (0..gallery.len()).map(Candidate::Gallery).collect();
    // gallery person id -> features merged from matched clusters
    let mut merged: HashMap<i64, Vec<FeatureVec>> = HashMap::new();
    let mut merged_order: Vec<i64> = Vec::new();

    for (cluster_idx, cluster) in clusters.iter().enumerate() {
        let rep = cluster.representative();
        let mut best: Option<(usize, f32)> = None;
        for (cand_idx, cand) in candidates.iter().enumerate() {
            let feats = match cand {
                Candidate::Gallery(g) => &gallery[*g].features,
                Candidate::New(n) => &new_founding[*n],
            };
            for feature in feats {
                let sim = rep.cosine_similarity(feature);
                if best.map_or(true, |(_, s)| sim > s) {
                    best = Some((cand_idx, sim));
                }
            }
        }

        let resolved = match best {
            Some((cand_idx, sim)) if sim >= gallery_threshold => match candidates[cand_idx] {
                Candidate::Gallery(g) => {
                    let person_id = gallery[g].id;
                    let entry = merged.entry(person_id).or_insert_with(|| {
                        merged_order.push(person_id);
                        Vec::new()
                    });
                    entry.extend(cluster.features.iter().cloned());
                    PlanRef::Existing(person_id)
                }
                Candidate::New(n) => {
                    plan.new_persons[n].extend(cluster.features.iter().cloned());
                    PlanRef::New(n)
                }
            },
            _ => {
                let n = plan.new_persons.len();
                plan.new_persons.push(cluster.features.clone());
                new_founding.push(cluster.features.clone());
                candidates.push(Candidate::New(n));
                PlanRef::New(n)
            }
        };

        if cluster_idx == 0 {
            plan.primary = Some(resolved);
        }
    }

    // One sighting per matched person per event, no matter how many
    // clusters collapsed onto it.
    for person_id in merged_order {
        plan.updates.push(PersonUpdate {
            person_id,
            features: merged.remove(&person_id).unwrap_or_default(),
        });
    }

    plan
}

/// Neighbor-feature centralization over one frame's feature set.
///
/// Each feature is summed with its mutual top-k neighbors (j counts for i
/// only when i is also within j's top-k2). Sums are taken over the
/// original vectors and the result is *not* re-normalized. With fewer than
/// `k1 + 1` features the input is returned unchanged.
pub fn centralize_features(features: &[FeatureVec], k1: usize, k2: usize) -> Vec<FeatureVec> {
    let n = features.len();
    if n < k1 + 1 {
        return features.to_vec();
    }

    // Neighbor indices per feature, most similar first.
    let mut ranked: Vec<Vec<usize>> = Vec::with_capacity(n);
    for i in 0..n {
        let mut others: Vec<(usize, f32)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, features[i].cosine_similarity(&features[j])))
            .collect();
        others.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.push(others.into_iter().map(|(j, _)| j).collect());
    }

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut sum = features[i].clone();
        for &j in ranked[i].iter().take(k1) {
            let mutual = ranked[j].iter().take(k2).any(|&back| back == i);
            if mutual {
                sum.add_assign(&features[j]);
            }
        }
        out.push(sum);
    }
    out
}

/// The full per-event gallery pass: dedup, cluster, reconcile, commit.
///
/// Returns the person id of the first cluster's final identity, or `None`
/// when no features were provided or the commit failed (in which case the
/// transaction rolled back and the event is persisted without an
/// identity).
pub fn assign_event_person(
    store: &mut Store,
    features: Vec<FeatureVec>,
    intra_threshold: f32,
    gallery_threshold: f32,
    now: DateTime<Local>,
) -> Option<i64> {
    let raw_count = features.len();
    let unique = dedup_features(features);
    if unique.is_empty() {
        return None;
    }
    info!(
        "re-id: {} raw features, {} unique after dedup",
        raw_count,
        unique.len()
    );
    let clusters = cluster_features(unique, intra_threshold);
    info!("re-id: {} intra-event cluster(s)", clusters.len());

    let gallery = match store.load_gallery() {
        Ok(g) => g,
        Err(e) => {
            warn!("re-id: gallery load failed, event keeps no identity: {e}");
            return None;
        }
    };
    let plan = reconcile(&clusters, &gallery, gallery_threshold);
    let new_count = plan.new_persons.len();
    let matched_count = plan.updates.len();
    match store.apply_reconcile(&plan, now) {
        Ok(primary) => {
            info!(
                "re-id: committed {} new person(s), re-identified {}",
                new_count, matched_count
            );
            primary
        }
        Err(e) => {
            warn!("re-id: commit failed and rolled back: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_store::GalleryPerson;

    fn feat(values: &[f32]) -> FeatureVec {
        FeatureVec::new(values.to_vec())
    }

    #[test]
    fn dedup_drops_only_byte_identical() {
        let unique = dedup_features(vec![
            feat(&[1.0, 2.0]),
            feat(&[1.0, 2.0]),
            feat(&[2.0, 4.0]), // same direction, different bytes: kept
            feat(&[1.0, 2.0]),
        ]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0], feat(&[1.0, 2.0]));
        assert_eq!(unique[1], feat(&[2.0, 4.0]));
    }

    #[test]
    fn clustering_splits_dissimilar_features() {
        let clusters = cluster_features(
            vec![
                feat(&[1.0, 0.0]),
                feat(&[0.99, 0.05]),
                feat(&[0.0, 1.0]),
                feat(&[0.05, 0.99]),
            ],
            0.90,
        );
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].features.len(), 2);
        assert_eq!(clusters[1].features.len(), 2);
        assert_eq!(clusters[0].representative(), &feat(&[1.0, 0.0]));
    }

    #[test]
    fn clustering_compares_against_representative_not_members() {
        // b joins a's cluster; c is close to b but not to the
        // representative a, so it founds its own cluster.
        let a = feat(&[1.0, 0.0]);
        let b = feat(&[0.92, 0.39]); // cos(a,b) ~ 0.92
        let c = feat(&[0.71, 0.71]); // cos(a,c) ~ 0.71, cos(b,c) ~ 0.93
        let clusters = cluster_features(vec![a, b, c], 0.90);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].features.len(), 2);
        assert_eq!(clusters[1].features.len(), 1);
    }

    fn gallery_person(id: i64, features: &[&[f32]]) -> GalleryPerson {
        GalleryPerson {
            id,
            sighting_count: 1,
            features: features.iter().map(|f| feat(f)).collect(),
        }
    }

    #[test]
    fn reconcile_matches_existing_person() {
        let gallery = vec![gallery_person(7, &[&[1.0, 0.0], &[0.9, 0.1]])];
        let clusters = cluster_features(vec![feat(&[0.99, 0.02])], 0.90);
        let plan = reconcile(&clusters, &gallery, 0.96);
        assert!(plan.new_persons.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].person_id, 7);
        assert_eq!(plan.updates[0].features.len(), 1);
        assert_eq!(plan.primary, Some(PlanRef::Existing(7)));
    }

    #[test]
    fn reconcile_below_threshold_creates_person() {
        let gallery = vec![gallery_person(7, &[&[1.0, 0.0]])];
        let clusters = cluster_features(vec![feat(&[0.0, 1.0])], 0.90);
        let plan = reconcile(&clusters, &gallery, 0.96);
        assert_eq!(plan.new_persons.len(), 1);
        assert!(plan.updates.is_empty());
        assert_eq!(plan.primary, Some(PlanRef::New(0)));
    }

    #[test]
    fn later_cluster_can_match_person_minted_this_event() {
        let clusters = vec![
            Cluster {
                features: vec![feat(&[1.0, 0.0])],
            },
            Cluster {
                features: vec![feat(&[0.999, 0.01])],
            },
        ];
        let plan = reconcile(&clusters, &[], 0.96);
        assert_eq!(plan.new_persons.len(), 1);
        // The second cluster's features folded into the first new person.
        assert_eq!(plan.new_persons[0].len(), 2);
        assert_eq!(plan.primary, Some(PlanRef::New(0)));
    }

    #[test]
    fn one_sighting_even_when_two_clusters_collapse() {
        // Two "people" wearing the same clothes: both clusters resolve to
        // gallery person 3, which is counted once.
        let gallery = vec![gallery_person(3, &[&[1.0, 0.0]])];
        let clusters = vec![
            Cluster {
                features: vec![feat(&[0.999, 0.01])],
            },
            Cluster {
                features: vec![feat(&[0.998, -0.02])],
            },
        ];
        let plan = reconcile(&clusters, &gallery, 0.96);
        assert!(plan.new_persons.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].person_id, 3);
        assert_eq!(plan.updates[0].features.len(), 2);
    }

    #[test]
    fn reconcile_is_deterministic_for_same_inputs() {
        let gallery = vec![
            gallery_person(1, &[&[1.0, 0.0, 0.0]]),
            gallery_person(2, &[&[0.0, 1.0, 0.0]]),
        ];
        let features = vec![
            feat(&[0.99, 0.01, 0.0]),
            feat(&[0.0, 0.98, 0.05]),
            feat(&[0.0, 0.0, 1.0]),
        ];
        let a = reconcile(&cluster_features(features.clone(), 0.90), &gallery, 0.94);
        let b = reconcile(&cluster_features(features, 0.90), &gallery, 0.94);
        let ids_a: Vec<i64> = a.updates.iter().map(|u| u.person_id).collect();
        let ids_b: Vec<i64> = b.updates.iter().map(|u| u.person_id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.new_persons.len(), b.new_persons.len());
        assert_eq!(a.primary, b.primary);
    }

    #[test]
    fn centralization_skips_small_sets() {
        let features = vec![feat(&[1.0, 0.0]), feat(&[0.0, 1.0])];
        let out = centralize_features(&features, 2, 2);
        assert_eq!(out, features);
    }

    #[test]
    fn centralization_sums_mutual_neighbors_without_renormalizing() {
        // Three nearly-parallel vectors: everyone is everyone's neighbor
        // at k = 2, so each output is the sum of all three.
        let features = vec![
            feat(&[1.0, 0.0]),
            feat(&[0.99, 0.01]),
            feat(&[0.98, 0.02]),
        ];
        let out = centralize_features(&features, 2, 2);
        let expected0 = feat(&[1.0 + 0.99 + 0.98, 0.0 + 0.01 + 0.02]);
        assert_eq!(out[0], expected0);
        // Norm clearly greater than 1: no re-normalization happened.
        let norm_sq: f32 = out[0].as_slice().iter().map(|v| v * v).sum();
        assert!(norm_sq > 4.0);
    }

    #[test]
    fn centralization_requires_mutuality() {
        // c is far from a and b; a and b are each other's top neighbor.
        // With k1 = k2 = 1, c's nearest is b, but b's top-1 is a, so c
        // gets no mutual neighbor and stays unchanged.
        let a = feat(&[1.0, 0.0]);
        let b = feat(&[0.99, 0.01]);
        let c = feat(&[0.0, 1.0]);
        let out = centralize_features(&[a.clone(), b.clone(), c.clone()], 1, 1);
        let mut ab = a.clone();
        ab.add_assign(&b);
        assert_eq!(out[0], ab);
        assert_eq!(out[2], c);
    }

    #[test]
    fn assign_event_person_end_to_end() {
        let mut store = Store::open_in_memory().unwrap();
        let now = Local::now();

        // First event: one person, two similar features.
        let first = assign_event_person(
            &mut store,
            vec![feat(&[1.0, 0.0]), feat(&[0.99, 0.01])],
            0.90,
            0.96,
            now,
        )
        .unwrap();
        assert_eq!(store.person_count().unwrap(), 1);

        // Second event: same appearance resolves to the same person.
        let second = assign_event_person(
            &mut store,
            vec![feat(&[0.995, 0.005])],
            0.90,
            0.96,
            now,
        )
        .unwrap();
        assert_eq!(second, first);
        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery[0].sighting_count, 2);
    }

    #[test]
    fn assign_event_person_with_no_features_is_none() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(
            assign_event_person(&mut store, vec![], 0.90, 0.96, Local::now()),
            None
        );
        assert_eq!(store.person_count().unwrap(), 0);
    }
}
