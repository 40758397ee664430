use crate::buckets::{BucketOrigin, TermBucket};
use crate::evaluate::{evaluate, Winner};
use crate::model::{CourseItem, EvaluationPolicy};
use crate::selection::Snapshot;
use crate::settings::{AlignedBestMerge, SelectionSettings};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResolution {
    pub group_id: String,
    pub term_aligned: bool,
    pub winners: BTreeMap<String, Winner>,
    pub total_points: f64,
    pub passed: bool,
    pub optional_passed: usize,
}

/// Resolves which child result wins for every child of `group`.
///
/// `buckets` come from [`crate::buckets::build_buckets`] and are ignored for
/// groups without term alignment, whose children are evaluated independently
/// over all their attempts.
pub fn resolve_group(
    group: &CourseItem,
    buckets: Vec<TermBucket>,
    snapshot: &Snapshot,
    settings: &SelectionSettings,
) -> GroupResolution {
    let winners = if group.term_aligned {
        let mut buckets = buckets;
        for bucket in buckets.iter_mut() {
            fill_bucket(bucket, group, snapshot);
        }
        // Stable: equal starts keep group terms ahead of child terms.
        buckets.sort_by(|a, b| a.term_start.cmp(&b.term_start));
        match group.policy {
            EvaluationPolicy::Last => walk_last(buckets),
            EvaluationPolicy::Best => walk_best(buckets, settings.aligned_best_merge),
        }
    } else {
        resolve_independent(group, snapshot)
    };

    let total_points: f64 = winners.values().map(|w| w.points).sum();

    let mut tally = PassTally::default();
    for child in snapshot.tree.children(group) {
        let ok = child_passes(child, winners.get(&child.id).map(|w| w.points));
        tally.record(child.mandatory, ok);
    }

    GroupResolution {
        group_id: group.id.clone(),
        term_aligned: group.term_aligned,
        passed: group_passes(group, &tally, total_points),
        optional_passed: tally.optional_passed,
        winners,
        total_points,
    }
}

fn resolve_independent(group: &CourseItem, snapshot: &Snapshot) -> BTreeMap<String, Winner> {
    let mut winners = BTreeMap::new();
    for child in snapshot.tree.children(group) {
        if let Some(r) = evaluate(
            &snapshot.results,
            &child.id,
            &snapshot.student_id,
            child.policy,
            None,
        ) {
            winners.insert(child.id.clone(), Winner::from(r));
        }
    }
    winners
}

fn fill_bucket(bucket: &mut TermBucket, group: &CourseItem, snapshot: &Snapshot) {
    let covered: Vec<&CourseItem> = match &bucket.origin {
        BucketOrigin::Group => snapshot.tree.children(group).collect(),
        BucketOrigin::Child(id) => snapshot.tree.get(id).into_iter().collect(),
    };
    for child in covered {
        if let Some(r) = evaluate(
            &snapshot.results,
            &child.id,
            &snapshot.student_id,
            child.policy,
            Some(&bucket.term_id),
        ) {
            bucket
                .results_by_child
                .insert(child.id.clone(), Winner::from(r));
        }
    }
}

/// Group terms reset the winner map; child terms patch their one entry.
/// Child terms before the first group term have nothing to patch.
fn walk_last(buckets: Vec<TermBucket>) -> BTreeMap<String, Winner> {
    let mut current: Option<BTreeMap<String, Winner>> = None;
    for bucket in buckets {
        if bucket.is_group_own_term() {
            current = Some(bucket.results_by_child);
        } else if let Some(cur) = current.as_mut() {
            cur.extend(bucket.results_by_child);
        }
    }
    current.unwrap_or_default()
}

/// Group terms open a new chain; child terms merge into the latest chain.
/// The chain with the highest total wins, the earliest one on ties.
fn walk_best(buckets: Vec<TermBucket>, merge: AlignedBestMerge) -> BTreeMap<String, Winner> {
    let mut chains: Vec<BTreeMap<String, Winner>> = Vec::new();
    for bucket in buckets {
        if bucket.is_group_own_term() {
            chains.push(bucket.results_by_child);
            continue;
        }
        let Some(chain) = chains.last_mut() else {
            continue;
        };
        for (child_id, candidate) in bucket.results_by_child {
            let replace = match merge {
                AlignedBestMerge::MaxPoints => chain
                    .get(&child_id)
                    .map(|existing| candidate.points > existing.points)
                    .unwrap_or(true),
                AlignedBestMerge::Latest => true,
            };
            if replace {
                chain.insert(child_id, candidate);
            }
        }
    }

    let mut best: Option<(f64, BTreeMap<String, Winner>)> = None;
    for chain in chains {
        let sum: f64 = chain.values().map(|w| w.points).sum();
        match &best {
            Some((best_sum, _)) if sum <= *best_sum => {}
            _ => best = Some((sum, chain)),
        }
    }
    best.map(|(_, chain)| chain).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassTally {
    pub mandatory_failed: bool,
    pub optional_passed: usize,
}

impl PassTally {
    pub fn record(&mut self, mandatory: bool, passed: bool) {
        if mandatory {
            if !passed {
                self.mandatory_failed = true;
            }
        } else if passed {
            self.optional_passed += 1;
        }
    }
}

/// An item passes on its own when it has a result reaching its minimum.
pub fn child_passes(item: &CourseItem, points: Option<f64>) -> bool {
    points.map(|p| p >= item.points_min).unwrap_or(false)
}

pub fn group_passes(group: &CourseItem, tally: &PassTally, total_points: f64) -> bool {
    if tally.mandatory_failed {
        return false;
    }
    if let Some(min) = group.choose_min {
        if (tally.optional_passed as i64) < min {
            return false;
        }
    }
    if group.mandatory && total_points < group.points_min {
        return false;
    }
    true
}
