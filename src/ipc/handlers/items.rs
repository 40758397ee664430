use crate::ipc::helpers::{
    get_object, get_opt_bool, get_opt_f64, get_opt_i64, get_opt_str, get_required_str, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn item_course(conn: &Connection, item_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT course_id FROM course_items WHERE id = ?",
        [item_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

// Kind and policy are stored as given; unknown values surface as
// configuration_integrity when the tree is evaluated.
fn items_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let item = get_object(params, "item")?;

    let item_id = get_opt_str(item, "id")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let parent_id = get_opt_str(item, "parentId")?.filter(|s| !s.is_empty());
    let name = get_required_str(item, "name")?;
    let kind = get_required_str(item, "kind")?;
    let policy = get_required_str(item, "policy")?;
    let points_min = get_opt_f64(item, "pointsMin")?.unwrap_or(0.0);
    let points_max = get_opt_f64(item, "pointsMax")?.unwrap_or(0.0);
    let mandatory = get_opt_bool(item, "mandatory")?.unwrap_or(false);
    let allow_negative = get_opt_bool(item, "allowNegative")?.unwrap_or(false);
    let term_aligned = get_opt_bool(item, "termAligned")?.unwrap_or(false);
    let choose_min = get_opt_i64(item, "chooseMin")?;
    let choose_max = get_opt_i64(item, "chooseMax")?;
    let sort_order = get_opt_i64(item, "sortOrder")?.unwrap_or(0);

    if let Some(existing) = item_course(conn, &item_id)? {
        if existing != course_id {
            return Err(HandlerErr::bad_params(format!(
                "course item {} belongs to course {}",
                item_id, existing
            )));
        }
    }
    if let Some(pid) = parent_id.as_deref() {
        if pid == item_id {
            return Err(HandlerErr::bad_params("an item cannot be its own parent"));
        }
        match item_course(conn, pid)? {
            None => return Err(HandlerErr::not_found("parent item not found")),
            Some(c) if c != course_id => {
                return Err(HandlerErr::bad_params("parent item belongs to another course"))
            }
            Some(_) => {}
        }
    }

    conn.execute(
        "INSERT INTO course_items(
            id, course_id, parent_id, name, kind, policy, points_min, points_max,
            mandatory, allow_negative, term_aligned, choose_min, choose_max, sort_order
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            parent_id = excluded.parent_id,
            name = excluded.name,
            kind = excluded.kind,
            policy = excluded.policy,
            points_min = excluded.points_min,
            points_max = excluded.points_max,
            mandatory = excluded.mandatory,
            allow_negative = excluded.allow_negative,
            term_aligned = excluded.term_aligned,
            choose_min = excluded.choose_min,
            choose_max = excluded.choose_max,
            sort_order = excluded.sort_order",
        rusqlite::params![
            item_id,
            course_id,
            parent_id,
            name,
            kind,
            policy,
            points_min,
            points_max,
            mandatory as i64,
            allow_negative as i64,
            term_aligned as i64,
            choose_min,
            choose_max,
            sort_order,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "course_items" })),
    })?;

    Ok(json!({ "itemId": item_id }))
}

fn items_tree(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let root_item_id = get_required_str(params, "rootItemId")?;
    let tree = store::load_tree(conn, &course_id, &root_item_id)?;
    Ok(json!({ "itemCount": tree.len(), "root": tree.to_json() }))
}

fn handle_items_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| items_upsert(conn, params))
}

fn handle_items_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| items_tree(conn, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "items.upsert" => Some(handle_items_upsert(state, req)),
        "items.tree" => Some(handle_items_tree(state, req)),
        _ => None,
    }
}
