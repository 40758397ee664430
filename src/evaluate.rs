use crate::model::{EvaluationPolicy, ResultRecord};
use serde::Serialize;

/// The winning attempt for one item, reduced to what aggregation needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub result_id: String,
    pub points: f64,
}

impl From<&ResultRecord> for Winner {
    fn from(r: &ResultRecord) -> Self {
        Self {
            result_id: r.id.clone(),
            points: r.points,
        }
    }
}

/// Picks the winning result of one student for one item.
///
/// `results` must be ordered newest first (see [`crate::model::sort_newest_first`]):
/// `Last` takes the first match and `Best` keeps the first of equally scored
/// matches, so both resolve ties towards the most recent attempt. With a
/// `term` filter only attempts made under that term are considered.
pub fn evaluate<'a>(
    results: &'a [ResultRecord],
    item_id: &str,
    student_id: &str,
    policy: EvaluationPolicy,
    term: Option<&str>,
) -> Option<&'a ResultRecord> {
    let mut matching = results.iter().filter(|r| {
        r.course_item_id == item_id
            && r.student_id == student_id
            && term.map(|t| r.term_id == t).unwrap_or(true)
    });

    match policy {
        EvaluationPolicy::Last => matching.next(),
        EvaluationPolicy::Best => {
            let mut best: Option<&ResultRecord> = None;
            for r in matching {
                match best {
                    Some(b) if r.points <= b.points => {}
                    _ => best = Some(r),
                }
            }
            best
        }
    }
}
