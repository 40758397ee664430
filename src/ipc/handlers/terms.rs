use crate::ipc::helpers::{get_object, get_opt_str, get_opt_timestamp, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::format_ts;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn terms_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term = get_object(params, "term")?;
    let term_id = get_opt_str(term, "id")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let item_id = get_required_str(term, "courseItemId")?;
    let name = get_opt_str(term, "name")?.unwrap_or_default();
    let Some(active_from) = get_opt_timestamp(term, "activeFrom")? else {
        return Err(HandlerErr::bad_params("missing activeFrom"));
    };
    let active_to = get_opt_timestamp(term, "activeTo")?;
    if let Some(to) = active_to {
        if to < active_from {
            return Err(HandlerErr::bad_params("activeTo must not precede activeFrom"));
        }
    }

    if !exists(conn, "SELECT 1 FROM course_items WHERE id = ?", &item_id)? {
        return Err(HandlerErr::not_found("course item not found"));
    }

    conn.execute(
        "INSERT INTO terms(id, course_item_id, name, active_from, active_to)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            course_item_id = excluded.course_item_id,
            name = excluded.name,
            active_from = excluded.active_from,
            active_to = excluded.active_to",
        (
            &term_id,
            &item_id,
            &name,
            format_ts(&active_from),
            active_to.as_ref().map(format_ts),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "terms" })),
    })?;

    Ok(json!({ "termId": term_id }))
}

fn terms_register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let student_id = get_required_str(params, "studentId")?;
    let registered_at = get_opt_timestamp(params, "registeredAt")?.unwrap_or_else(Utc::now);

    if !exists(conn, "SELECT 1 FROM terms WHERE id = ?", &term_id)? {
        return Err(HandlerErr::not_found("term not found"));
    }

    conn.execute(
        "INSERT INTO term_registrations(term_id, student_id, registered_at)
         VALUES(?, ?, ?)
         ON CONFLICT(term_id, student_id) DO UPDATE SET registered_at = excluded.registered_at",
        (&term_id, &student_id, format_ts(&registered_at)),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "term_registrations" })),
    })?;

    Ok(json!({
        "termId": term_id,
        "studentId": student_id,
        "registeredAt": format_ts(&registered_at),
    }))
}

fn handle_terms_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| terms_upsert(conn, params))
}

fn handle_terms_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, _, params| terms_register(conn, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.upsert" => Some(handle_terms_upsert(state, req)),
        "terms.register" => Some(handle_terms_register(state, req)),
        _ => None,
    }
}
