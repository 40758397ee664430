use crate::error::IntegrityError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Test,
    Activity,
    Group,
}

impl ItemKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "activity" => Some(Self::Activity),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Activity => "activity",
            Self::Group => "group",
        }
    }

    pub fn is_leaf(self) -> bool {
        match self {
            Self::Test | Self::Activity => true,
            Self::Group => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationPolicy {
    Best,
    Last,
}

impl EvaluationPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "best" => Some(Self::Best),
            "last" => Some(Self::Last),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Last => "last",
        }
    }
}

/// One `course_items` row as stored. Kind and policy stay textual until the
/// row is validated into a [`CourseItem`].
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: String,
    pub policy: String,
    pub points_min: f64,
    pub points_max: f64,
    pub mandatory: bool,
    pub allow_negative: bool,
    pub term_aligned: bool,
    pub choose_min: Option<i64>,
    pub choose_max: Option<i64>,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct CourseItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: ItemKind,
    pub policy: EvaluationPolicy,
    pub points_min: f64,
    pub points_max: f64,
    pub mandatory: bool,
    pub allow_negative: bool,
    pub term_aligned: bool,
    pub choose_min: Option<i64>,
    pub choose_max: Option<i64>,
    pub sort_order: i64,
    pub children: Vec<String>,
}

impl CourseItem {
    fn from_row(row: &ItemRow, children: Vec<String>) -> Result<Self, IntegrityError> {
        let Some(kind) = ItemKind::parse(&row.kind) else {
            return Err(IntegrityError::UnknownKind {
                item_id: row.id.clone(),
                kind: row.kind.clone(),
            });
        };
        let Some(policy) = EvaluationPolicy::parse(&row.policy) else {
            return Err(IntegrityError::UnknownPolicy {
                item_id: row.id.clone(),
                policy: row.policy.clone(),
            });
        };

        if kind.is_leaf() {
            if let Some(child_id) = children.first() {
                return Err(IntegrityError::ChildrenUnderLeaf {
                    item_id: row.id.clone(),
                    child_id: child_id.clone(),
                });
            }
            let group_field = if row.term_aligned {
                Some("termAligned")
            } else if row.choose_min.is_some() {
                Some("chooseMin")
            } else if row.choose_max.is_some() {
                Some("chooseMax")
            } else {
                None
            };
            if let Some(field) = group_field {
                return Err(IntegrityError::GroupFieldOnLeaf {
                    item_id: row.id.clone(),
                    field,
                });
            }
        }

        if row.choose_min.map(|v| v < 0).unwrap_or(false) {
            return Err(IntegrityError::NegativeChoose {
                item_id: row.id.clone(),
                field: "chooseMin",
            });
        }
        if row.choose_max.map(|v| v < 0).unwrap_or(false) {
            return Err(IntegrityError::NegativeChoose {
                item_id: row.id.clone(),
                field: "chooseMax",
            });
        }
        if let (Some(min), Some(max)) = (row.choose_min, row.choose_max) {
            if min > max {
                return Err(IntegrityError::ChooseRange {
                    item_id: row.id.clone(),
                    min,
                    max,
                });
            }
        }

        Ok(Self {
            id: row.id.clone(),
            parent_id: row.parent_id.clone(),
            name: row.name.clone(),
            kind,
            policy,
            points_min: row.points_min,
            points_max: row.points_max,
            mandatory: row.mandatory,
            allow_negative: row.allow_negative,
            term_aligned: row.term_aligned,
            choose_min: row.choose_min,
            choose_max: row.choose_max,
            sort_order: row.sort_order,
            children,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub id: String,
    pub course_item_id: String,
    pub name: String,
    pub active_from: DateTime<Utc>,
    pub active_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    /// Insertion order; breaks ties between results created at the same instant.
    #[serde(skip)]
    pub seq: i64,
    pub course_id: String,
    pub student_id: String,
    pub course_item_id: String,
    pub term_id: String,
    pub points: f64,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub selected: bool,
    #[serde(serialize_with = "serialize_ts")]
    pub created_at: DateTime<Utc>,
}

fn serialize_ts<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_ts(ts))
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
}

/// Newest first; later insertions win over earlier ones at the same timestamp.
pub fn sort_newest_first(results: &mut [ResultRecord]) {
    results.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        Ordering::Equal => b.seq.cmp(&a.seq),
        ord => ord,
    });
}

/// Validated subtree of course items, stored as an arena keyed by id.
#[derive(Debug, Clone)]
pub struct ItemTree {
    root_id: String,
    items: HashMap<String, CourseItem>,
}

impl ItemTree {
    /// Builds the subtree rooted at `root_id` out of every item row of a course.
    ///
    /// Returns `Ok(None)` when the root does not exist. Only rows inside the
    /// subtree are validated, so a broken item elsewhere in the course does not
    /// block this tree.
    pub fn build(rows: &[ItemRow], root_id: &str) -> Result<Option<Self>, IntegrityError> {
        let by_id: HashMap<&str, &ItemRow> = rows.iter().map(|r| (r.id.as_str(), r)).collect();
        if !by_id.contains_key(root_id) {
            return Ok(None);
        }

        let mut children_of: HashMap<&str, Vec<&ItemRow>> = HashMap::new();
        for row in rows {
            if let Some(parent) = row.parent_id.as_deref() {
                children_of.entry(parent).or_default().push(row);
            }
        }
        for list in children_of.values_mut() {
            list.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
        }

        let mut items = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![root_id];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                return Err(IntegrityError::Cycle {
                    item_id: id.to_string(),
                });
            }
            let row = by_id[id];
            let kid_rows: &[&ItemRow] = children_of.get(id).map(|v| v.as_slice()).unwrap_or(&[]);
            for kid in kid_rows.iter().rev() {
                stack.push(kid.id.as_str());
            }
            let kids: Vec<String> = kid_rows.iter().map(|r| r.id.clone()).collect();
            let item = CourseItem::from_row(row, kids)?;
            items.insert(item.id.clone(), item);
        }

        // A root whose parent chain loops back into its own subtree.
        let mut cursor = by_id[root_id].parent_id.as_deref();
        let mut seen_up: HashSet<&str> = HashSet::new();
        while let Some(pid) = cursor {
            if visited.contains(pid) || !seen_up.insert(pid) {
                return Err(IntegrityError::Cycle {
                    item_id: root_id.to_string(),
                });
            }
            cursor = by_id.get(pid).and_then(|r| r.parent_id.as_deref());
        }

        Ok(Some(Self {
            root_id: root_id.to_string(),
            items,
        }))
    }

    pub fn root(&self) -> &CourseItem {
        &self.items[&self.root_id]
    }

    pub fn get(&self, id: &str) -> Option<&CourseItem> {
        self.items.get(id)
    }

    pub fn children<'a>(&'a self, item: &'a CourseItem) -> impl Iterator<Item = &'a CourseItem> {
        item.children.iter().filter_map(move |id| self.items.get(id))
    }

    /// Root first, then descendants depth-first in child order.
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack = vec![self.root_id.as_str()];
        while let Some(id) = stack.pop() {
            out.push(id.to_string());
            if let Some(item) = self.items.get(id) {
                for kid in item.children.iter().rev() {
                    stack.push(kid.as_str());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.item_json(self.root())
    }

    fn item_json(&self, item: &CourseItem) -> serde_json::Value {
        let children: Vec<serde_json::Value> =
            self.children(item).map(|c| self.item_json(c)).collect();
        json!({
            "id": item.id,
            "parentId": item.parent_id,
            "name": item.name,
            "kind": item.kind.as_str(),
            "policy": item.policy.as_str(),
            "pointsMin": item.points_min,
            "pointsMax": item.points_max,
            "mandatory": item.mandatory,
            "allowNegative": item.allow_negative,
            "termAligned": item.term_aligned,
            "chooseMin": item.choose_min,
            "chooseMax": item.choose_max,
            "sortOrder": item.sort_order,
            "children": children,
        })
    }
}
