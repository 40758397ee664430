use crate::evaluate::Winner;
use crate::model::{CourseItem, EvaluationPolicy, Term};
use crate::selection::Snapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum BucketOrigin {
    /// A term of the group itself; covers every child.
    Group,
    /// A term a single child was attempted in on its own.
    Child(String),
}

/// Candidate child results gathered under one term of a term-aligned group.
#[derive(Debug, Clone)]
pub struct TermBucket {
    pub term_id: String,
    pub origin: BucketOrigin,
    pub term_start: DateTime<Utc>,
    pub results_by_child: BTreeMap<String, Winner>,
}

impl TermBucket {
    fn scaffold(term: &Term, origin: BucketOrigin) -> Self {
        Self {
            term_id: term.id.clone(),
            origin,
            term_start: term.active_from,
            results_by_child: BTreeMap::new(),
        }
    }

    pub fn is_group_own_term(&self) -> bool {
        matches!(self.origin, BucketOrigin::Group)
    }
}

/// Builds the empty buckets of a term-aligned group.
///
/// Non-aligned groups and leaves get no buckets. Terms come from the snapshot
/// and are ordered most recent registration first, so under `Last` the first
/// term of each item is the one that counts.
pub fn build_buckets(group: &CourseItem, snapshot: &Snapshot) -> Vec<TermBucket> {
    if group.kind.is_leaf() || !group.term_aligned {
        return Vec::new();
    }

    let mut buckets = Vec::new();
    let own_terms = snapshot.terms_of(&group.id);
    match group.policy {
        EvaluationPolicy::Best => {
            for term in own_terms {
                buckets.push(TermBucket::scaffold(term, BucketOrigin::Group));
            }
        }
        EvaluationPolicy::Last => {
            if let Some(term) = own_terms.first() {
                buckets.push(TermBucket::scaffold(term, BucketOrigin::Group));
            }
        }
    }

    for child in snapshot.tree.children(group) {
        let child_terms = snapshot.terms_of(&child.id);
        match group.policy {
            EvaluationPolicy::Best => {
                for term in child_terms {
                    buckets.push(TermBucket::scaffold(
                        term,
                        BucketOrigin::Child(child.id.clone()),
                    ));
                }
            }
            EvaluationPolicy::Last => {
                if let Some(term) = child_terms.first() {
                    buckets.push(TermBucket::scaffold(
                        term,
                        BucketOrigin::Child(child.id.clone()),
                    ));
                }
            }
        }
    }

    buckets
}
