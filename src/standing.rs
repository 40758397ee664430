use crate::aggregate::{child_passes, group_passes, PassTally};
use crate::error::RecomputeError;
use crate::model::{CourseItem, ItemKind, ItemTree, ResultRecord};
use crate::settings::SelectionSettings;
use crate::store;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStanding {
    pub item_id: String,
    pub name: String,
    pub kind: &'static str,
    pub mandatory: bool,
    pub points: f64,
    pub passed: bool,
    pub selected_result_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_passed: Option<usize>,
    pub choose_min: Option<i64>,
    pub choose_max: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemStanding>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStanding {
    pub course_id: String,
    pub student_id: String,
    pub total_points: f64,
    pub items: Vec<ItemStanding>,
}

/// Maps item id to the selected result of one student. If a manual override
/// ever left two marks on one item, the newest wins.
pub fn selected_by_item(results: &[ResultRecord]) -> HashMap<&str, &ResultRecord> {
    let mut out: HashMap<&str, &ResultRecord> = HashMap::new();
    for r in results.iter().filter(|r| r.selected) {
        out.entry(r.course_item_id.as_str()).or_insert(r);
    }
    out
}

/// Points and pass state of `item`, computed from already selected results.
pub fn item_standing(
    tree: &ItemTree,
    item: &CourseItem,
    selected: &HashMap<&str, &ResultRecord>,
    settings: &SelectionSettings,
) -> ItemStanding {
    let clamp = |points: f64| {
        if settings.clamp_negative_totals && !item.allow_negative {
            points.max(0.0)
        } else {
            points
        }
    };

    match item.kind {
        ItemKind::Test | ItemKind::Activity => {
            let chosen = selected.get(item.id.as_str()).copied();
            ItemStanding {
                item_id: item.id.clone(),
                name: item.name.clone(),
                kind: item.kind.as_str(),
                mandatory: item.mandatory,
                points: clamp(chosen.map(|r| r.points).unwrap_or(0.0)),
                passed: child_passes(item, chosen.map(|r| r.points)),
                selected_result_id: chosen.map(|r| r.id.clone()),
                optional_passed: None,
                choose_min: None,
                choose_max: None,
                children: Vec::new(),
            }
        }
        ItemKind::Group => {
            let children: Vec<ItemStanding> = tree
                .children(item)
                .map(|child| item_standing(tree, child, selected, settings))
                .collect();
            let mut tally = PassTally::default();
            for c in &children {
                tally.record(c.mandatory, c.passed);
            }
            // Pass state uses the raw sum; only the reported points are clamped.
            let total: f64 = children.iter().map(|c| c.points).sum();
            ItemStanding {
                item_id: item.id.clone(),
                name: item.name.clone(),
                kind: item.kind.as_str(),
                mandatory: item.mandatory,
                points: clamp(total),
                passed: group_passes(item, &tally, total),
                selected_result_id: selected.get(item.id.as_str()).map(|r| r.id.clone()),
                optional_passed: Some(tally.optional_passed),
                choose_min: item.choose_min,
                choose_max: item.choose_max,
                children,
            }
        }
    }
}

pub fn course_standing(
    conn: &Connection,
    settings: &SelectionSettings,
    course_id: &str,
    student_id: &str,
) -> Result<CourseStanding, RecomputeError> {
    let results = store::results_for_student(conn, course_id, student_id)?;
    let selected = selected_by_item(&results);

    let mut items = Vec::new();
    for root_id in store::root_item_ids(conn, course_id)? {
        let tree = store::load_tree(conn, course_id, &root_id)?;
        items.push(item_standing(&tree, tree.root(), &selected, settings));
    }
    Ok(CourseStanding {
        course_id: course_id.to_string(),
        student_id: student_id.to_string(),
        total_points: items.iter().map(|i| i.points).sum(),
        items,
    })
}
