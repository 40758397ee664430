use crate::db;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const SELECTION_SETTINGS_KEY: &str = "setup.selection";

/// How a child-only term attempt merges into a term-aligned Best chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignedBestMerge {
    /// Replace the chain entry only when the new attempt scored strictly more.
    MaxPoints,
    /// Replace the chain entry whenever a later attempt exists.
    Latest,
}

impl AlignedBestMerge {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "max_points" => Some(Self::MaxPoints),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxPoints => "max_points",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionSettings {
    pub aligned_best_merge: AlignedBestMerge,
    pub include_non_final: bool,
    pub clamp_negative_totals: bool,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            aligned_best_merge: AlignedBestMerge::MaxPoints,
            include_non_final: true,
            clamp_negative_totals: true,
        }
    }
}

impl SelectionSettings {
    pub fn to_json(&self) -> Value {
        json!({
            "alignedBestMerge": self.aligned_best_merge.as_str(),
            "includeNonFinal": self.include_non_final,
            "clampNegativeTotals": self.clamp_negative_totals,
        })
    }

    /// Applies a partial update; unknown keys and wrong types are rejected.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "alignedBestMerge" => {
                    let raw = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be a string", k))?;
                    self.aligned_best_merge = AlignedBestMerge::parse(raw)
                        .ok_or_else(|| format!("{} must be one of: max_points, latest", k))?;
                }
                "includeNonFinal" => {
                    self.include_non_final = parse_bool(v, k)?;
                }
                "clampNegativeTotals" => {
                    self.clamp_negative_totals = parse_bool(v, k)?;
                }
                _ => return Err(format!("unknown selection field: {}", k)),
            }
        }
        Ok(())
    }

    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let mut current = Self::default();
        if let Some(saved) = db::settings_get_json(conn, SELECTION_SETTINGS_KEY)? {
            if let Some(saved_obj) = saved.as_object() {
                // Malformed historical values fall back to defaults field by field.
                for (k, v) in saved_obj {
                    let mut single = Map::new();
                    single.insert(k.clone(), v.clone());
                    if let Err(msg) = current.apply_patch(&single) {
                        tracing::warn!(key = %k, error = %msg, "ignoring saved selection setting");
                    }
                }
            }
        }
        Ok(current)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SELECTION_SETTINGS_KEY, &self.to_json())
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be a boolean", key))
}
