//! Read and write access to items, terms and results inside a caller-owned
//! connection or transaction.

use crate::error::{IntegrityError, RecomputeError};
use crate::model::{format_ts, parse_ts, ItemRow, ItemTree, ResultRecord, Term};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};

pub fn load_item_rows(conn: &Connection, course_id: &str) -> rusqlite::Result<Vec<ItemRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, name, kind, policy, points_min, points_max,
                mandatory, allow_negative, term_aligned, choose_min, choose_max, sort_order
         FROM course_items
         WHERE course_id = ?
         ORDER BY sort_order, id",
    )?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(ItemRow {
                id: r.get(0)?,
                parent_id: r.get(1)?,
                name: r.get(2)?,
                kind: r.get(3)?,
                policy: r.get(4)?,
                points_min: r.get(5)?,
                points_max: r.get(6)?,
                mandatory: r.get::<_, i64>(7)? != 0,
                allow_negative: r.get::<_, i64>(8)? != 0,
                term_aligned: r.get::<_, i64>(9)? != 0,
                choose_min: r.get(10)?,
                choose_max: r.get(11)?,
                sort_order: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_tree(
    conn: &Connection,
    course_id: &str,
    root_item_id: &str,
) -> Result<ItemTree, RecomputeError> {
    let rows =
        load_item_rows(conn, course_id).map_err(RecomputeError::TreeLoad)?;
    match ItemTree::build(&rows, root_item_id)? {
        Some(tree) => Ok(tree),
        None => Err(RecomputeError::RootNotFound {
            course_id: course_id.to_string(),
            item_id: root_item_id.to_string(),
        }),
    }
}

pub fn root_item_ids(conn: &Connection, course_id: &str) -> Result<Vec<String>, RecomputeError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM course_items
             WHERE course_id = ? AND parent_id IS NULL
             ORDER BY sort_order, id",
        )
        .map_err(RecomputeError::TreeLoad)?;
    let ids = stmt
        .query_map([course_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(RecomputeError::TreeLoad)?;
    Ok(ids)
}

/// Walks parent links up to the top-level item that owns `item_id`.
pub fn root_of(conn: &Connection, item_id: &str) -> Result<Option<String>, RecomputeError> {
    let mut seen = HashSet::new();
    let mut previous: Option<String> = None;
    let mut current = item_id.to_string();
    loop {
        if !seen.insert(current.clone()) {
            return Err(IntegrityError::Cycle { item_id: current }.into());
        }
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM course_items WHERE id = ?",
                [&current],
                |r| r.get(0),
            )
            .optional()
            .map_err(RecomputeError::TreeLoad)?;
        match parent {
            // Unknown item, or a dangling parent link: the last existing item is the root.
            None => return Ok(previous),
            Some(None) => return Ok(Some(current)),
            Some(Some(pid)) => {
                previous = Some(std::mem::replace(&mut current, pid));
            }
        }
    }
}

/// Terms of `item_id` the student signed up for, most recent registration first.
pub fn terms_for(conn: &Connection, item_id: &str, student_id: &str) -> rusqlite::Result<Vec<Term>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.course_item_id, t.name, t.active_from, t.active_to
         FROM terms t
         JOIN term_registrations tr ON tr.term_id = t.id AND tr.student_id = ?
         WHERE t.course_item_id = ?
         ORDER BY tr.registered_at DESC, t.id",
    )?;
    let raw = stmt
        .query_map((student_id, item_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut terms = Vec::with_capacity(raw.len());
    for (id, course_item_id, name, from, to) in raw {
        let active_from = parse_ts(&from).map_err(|e| bad_timestamp(3, e))?;
        let active_to = match to {
            Some(t) => Some(parse_ts(&t).map_err(|e| bad_timestamp(4, e))?),
            None => None,
        };
        terms.push(Term {
            id,
            course_item_id,
            name,
            active_from,
            active_to,
        });
    }
    Ok(terms)
}

pub fn terms_by_item(
    conn: &Connection,
    tree: &ItemTree,
    student_id: &str,
) -> Result<HashMap<String, Vec<Term>>, RecomputeError> {
    let mut out = HashMap::new();
    for id in tree.subtree_ids() {
        let terms =
            terms_for(conn, &id, student_id).map_err(RecomputeError::TreeLoad)?;
        out.insert(id, terms);
    }
    Ok(out)
}

fn bad_timestamp(col: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

const RESULT_COLUMNS: &str = "rowid, id, course_id, student_id, course_item_id, term_id, points, final, selected, created_at";

fn map_result_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRecord> {
    let created: String = r.get(9)?;
    Ok(ResultRecord {
        seq: r.get(0)?,
        id: r.get(1)?,
        course_id: r.get(2)?,
        student_id: r.get(3)?,
        course_item_id: r.get(4)?,
        term_id: r.get(5)?,
        points: r.get(6)?,
        is_final: r.get::<_, i64>(7)? != 0,
        selected: r.get::<_, i64>(8)? != 0,
        created_at: parse_ts(&created).map_err(|e| bad_timestamp(9, e))?,
    })
}

pub fn results_for_student(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<Vec<ResultRecord>, RecomputeError> {
    let sql = format!(
        "SELECT {RESULT_COLUMNS} FROM results
         WHERE course_id = ? AND student_id = ?
         ORDER BY created_at DESC, rowid DESC"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(RecomputeError::ResultRead)?;
    let results = stmt
        .query_map((course_id, student_id), map_result_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(RecomputeError::ResultRead)?;
    Ok(results)
}

pub fn find_result(conn: &Connection, result_id: &str) -> rusqlite::Result<Option<ResultRecord>> {
    let sql = format!("SELECT {RESULT_COLUMNS} FROM results WHERE id = ?");
    conn.query_row(&sql, [result_id], map_result_row).optional()
}

/// Clears `selected` on every result of the student for the given items.
pub fn clear_selected(
    conn: &Connection,
    student_id: &str,
    item_ids: &[String],
) -> rusqlite::Result<usize> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = std::iter::repeat("?")
        .take(item_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "UPDATE results SET selected = 0
         WHERE selected = 1 AND student_id = ? AND course_item_id IN ({})",
        placeholders
    );
    let mut bind: Vec<Value> = Vec::with_capacity(item_ids.len() + 1);
    bind.push(Value::Text(student_id.to_string()));
    for id in item_ids {
        bind.push(Value::Text(id.clone()));
    }
    conn.execute(&sql, params_from_iter(bind))
}

pub fn set_selected(conn: &Connection, result_ids: &[String], value: bool) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("UPDATE results SET selected = ? WHERE id = ?")?;
    let mut changed = 0;
    for id in result_ids {
        changed += stmt.execute((value as i64, id))?;
    }
    Ok(changed)
}

#[derive(Debug, Clone)]
pub struct NewResult<'a> {
    pub id: &'a str,
    pub course_id: &'a str,
    pub student_id: &'a str,
    pub course_item_id: &'a str,
    pub term_id: &'a str,
    pub points: f64,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

pub fn insert_result(conn: &Connection, r: &NewResult<'_>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO results(id, course_id, student_id, course_item_id, term_id, points, final, selected, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            r.id,
            r.course_id,
            r.student_id,
            r.course_item_id,
            r.term_id,
            r.points,
            r.is_final as i64,
            format_ts(&r.created_at),
        ),
    )?;
    Ok(())
}

pub fn update_points(
    conn: &Connection,
    result_id: &str,
    points: f64,
    is_final: Option<bool>,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE results
         SET points = ?, final = COALESCE(?, final), updated_at = ?
         WHERE id = ?",
        (points, is_final.map(|f| f as i64), format_ts(&now), result_id),
    )
}
