use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::selection::{self, SelectionLocks};
use crate::settings::SelectionSettings;
use crate::standing;
use crate::store;
use rusqlite::Connection;
use serde_json::json;

fn load_settings(conn: &Connection) -> Result<SelectionSettings, HandlerErr> {
    SelectionSettings::load(conn).map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn selection_recompute(
    conn: &mut Connection,
    locks: &SelectionLocks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let root_item_id = get_required_str(params, "rootItemId")?;
    let student_id = get_required_str(params, "studentId")?;
    let settings = load_settings(conn)?;

    let outcome = selection::recompute_serialized(
        conn,
        locks,
        &settings,
        &course_id,
        &root_item_id,
        &student_id,
    )?;
    Ok(json!(outcome))
}

/// Every top-level item of the course, committed as one unit.
fn selection_recompute_course(
    conn: &mut Connection,
    locks: &SelectionLocks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let settings = load_settings(conn)?;

    let roots = store::root_item_ids(conn, &course_id)?;
    let outcomes = selection::in_recompute_tx(conn, locks, &student_id, &roots, |tx| {
        selection::recompute_course(tx, &settings, &course_id, &student_id)
    })?;
    Ok(json!({
        "courseId": course_id,
        "studentId": student_id,
        "roots": outcomes,
    }))
}

fn standing_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let settings = load_settings(conn)?;
    let report = standing::course_standing(conn, &settings, &course_id, &student_id)?;
    Ok(json!(report))
}

fn handle_selection_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, selection_recompute)
}

fn handle_selection_recompute_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, selection_recompute_course)
}

fn handle_standing_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| standing_get(conn, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "selection.recompute" => Some(handle_selection_recompute(state, req)),
        "selection.recomputeCourse" => Some(handle_selection_recompute_course(state, req)),
        "standing.get" => Some(handle_standing_get(state, req)),
        _ => None,
    }
}
