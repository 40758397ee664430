use crate::error::RecomputeError;
use crate::ipc::error::{err, ok, recompute_details};
use crate::ipc::types::{AppState, Request};
use crate::model::parse_ts;
use crate::selection::SelectionLocks;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn db(code: &'static str, e: impl std::fmt::Display) -> Self {
        Self::new(code, e.to_string())
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<RecomputeError> for HandlerErr {
    fn from(e: RecomputeError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: recompute_details(&e),
        }
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string", key))),
    }
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    let n = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing numeric {}", key)))?;
    if !n.is_finite() {
        return Err(HandlerErr::bad_params(format!("{} must be finite", key)));
    }
    Ok(n)
}

pub fn get_opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => get_required_f64(params, key).map(Some),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_opt_timestamp(params: &Value, key: &str) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match get_opt_str(params, key)? {
        None => Ok(None),
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .map_err(|e| HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp: {}", key, e))),
    }
}

pub fn get_object<'a>(params: &'a Value, key: &str) -> Result<&'a Value, HandlerErr> {
    params
        .get(key)
        .filter(|v| v.is_object())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an object", key)))
}

/// Runs a handler body against the open workspace database.
pub fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&mut Connection, &SelectionLocks, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let AppState { db, locks, .. } = state;
    let Some(conn) = db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, locks, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}
