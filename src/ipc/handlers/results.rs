use crate::error::RecomputeError;
use crate::ipc::helpers::{
    get_object, get_opt_bool, get_opt_str, get_opt_timestamp, get_required_f64, get_required_str,
    with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::ResultRecord;
use crate::selection::{self, SelectionLocks};
use crate::settings::SelectionSettings;
use crate::store::{self, NewResult};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn load_settings(conn: &Connection) -> Result<SelectionSettings, HandlerErr> {
    SelectionSettings::load(conn).map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn root_for_item(conn: &Connection, item_id: &str) -> Result<String, HandlerErr> {
    store::root_of(conn, item_id)?.ok_or_else(|| HandlerErr::not_found("course item not found"))
}

fn existing_result(conn: &Connection, result_id: &str) -> Result<ResultRecord, HandlerErr> {
    store::find_result(conn, result_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("result not found"))
}

/// Recomputes the root that owns `item_id` after a result write has been
/// committed. A failure is reported next to the stored result and never
/// undoes the write.
fn selection_after_write(
    conn: &mut Connection,
    locks: &SelectionLocks,
    settings: &SelectionSettings,
    course_id: &str,
    item_id: &str,
    student_id: &str,
    result_id: &str,
) -> serde_json::Value {
    let outcome = match store::root_of(conn, item_id) {
        Ok(Some(root_item_id)) => selection::recompute_serialized(
            conn,
            locks,
            settings,
            course_id,
            &root_item_id,
            student_id,
        ),
        Ok(None) => Err(RecomputeError::RootNotFound {
            course_id: course_id.to_string(),
            item_id: item_id.to_string(),
        }),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outcome) => json!({
            "resultId": result_id,
            "rootItemId": outcome.root_item_id,
            "selected": outcome.selected.iter().any(|id| id == result_id),
            "selection": outcome,
        }),
        Err(e) => {
            tracing::warn!(result_id, code = e.code(), error = %e, "result stored but selection not recomputed");
            let selected = store::find_result(conn, result_id)
                .ok()
                .flatten()
                .map(|r| r.selected)
                .unwrap_or(false);
            let failure = HandlerErr::from(e);
            json!({
                "resultId": result_id,
                "rootItemId": null,
                "selected": selected,
                "selection": null,
                "selectionError": {
                    "code": failure.code,
                    "message": failure.message,
                    "details": failure.details,
                },
            })
        }
    }
}

/// Attempt finalization: the new result is stored first, then its root is recomputed.
fn results_record(
    conn: &mut Connection,
    locks: &SelectionLocks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let result = get_object(params, "result")?;
    let result_id = get_opt_str(result, "id")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let student_id = get_required_str(result, "studentId")?;
    let item_id = get_required_str(result, "courseItemId")?;
    let term_id = get_required_str(result, "termId")?;
    let points = get_required_f64(result, "points")?;
    let is_final = get_opt_bool(result, "final")?.unwrap_or(true);
    let created_at = get_opt_timestamp(result, "createdAt")?.unwrap_or_else(Utc::now);

    let item_course: Option<String> = conn
        .query_row(
            "SELECT course_id FROM course_items WHERE id = ?",
            [&item_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match item_course {
        None => return Err(HandlerErr::not_found("course item not found")),
        Some(c) if c != course_id => {
            return Err(HandlerErr::bad_params("course item belongs to another course"))
        }
        Some(_) => {}
    }
    let term_exists = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [&term_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !term_exists {
        return Err(HandlerErr::not_found("term not found"));
    }
    if store::find_result(conn, &result_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some()
    {
        return Err(HandlerErr::bad_params(format!("result {} already exists", result_id)));
    }

    let settings = load_settings(conn)?;
    store::insert_result(
        conn,
        &NewResult {
            id: &result_id,
            course_id: &course_id,
            student_id: &student_id,
            course_item_id: &item_id,
            term_id: &term_id,
            points,
            is_final,
            created_at,
        },
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(selection_after_write(
        conn,
        locks,
        &settings,
        &course_id,
        &item_id,
        &student_id,
        &result_id,
    ))
}

/// Manual correction: the changed points are stored first, then re-evaluated.
fn results_update_points(
    conn: &mut Connection,
    locks: &SelectionLocks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let points = get_required_f64(params, "points")?;
    let is_final = get_opt_bool(params, "final")?;

    let existing = existing_result(conn, &result_id)?;
    let settings = load_settings(conn)?;
    store::update_points(conn, &result_id, points, is_final, Utc::now())
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    Ok(selection_after_write(
        conn,
        locks,
        &settings,
        &existing.course_id,
        &existing.course_item_id,
        &existing.student_id,
        &result_id,
    ))
}

fn results_toggle_selected(
    conn: &mut Connection,
    locks: &SelectionLocks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let existing = existing_result(conn, &result_id)?;
    let root_item_id = root_for_item(conn, &existing.course_item_id)?;
    let roots = [root_item_id];

    // Re-read under the lock so a concurrent recompute cannot leave a stale flag.
    let selected = selection::in_recompute_tx(conn, locks, &existing.student_id, &roots, |tx| {
        let current = store::find_result(tx, &result_id)
            .and_then(|found| found.ok_or(rusqlite::Error::QueryReturnedNoRows))
            .map_err(RecomputeError::ResultRead)?;
        selection::toggle_selected(tx, &current).map_err(RecomputeError::Persistence)
    })?;
    tracing::info!(result_id = %result_id, selected, "selection toggled manually");

    Ok(json!({ "resultId": result_id, "selected": selected }))
}

fn results_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let item_filter = get_opt_str(params, "courseItemId")?;

    let mut results = store::results_for_student(conn, &course_id, &student_id)?;
    if let Some(item_id) = item_filter {
        results.retain(|r| r.course_item_id == item_id);
    }
    Ok(json!({ "results": results }))
}

fn handle_results_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, results_record)
}

fn handle_results_update_points(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, results_update_points)
}

fn handle_results_toggle_selected(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, results_toggle_selected)
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| results_list(conn, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.record" => Some(handle_results_record(state, req)),
        "results.updatePoints" => Some(handle_results_update_points(state, req)),
        "results.toggleSelected" => Some(handle_results_toggle_selected(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        _ => None,
    }
}
