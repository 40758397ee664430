use crate::error::RecomputeError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Integrity errors name the offending item so the caller can point at it.
pub fn recompute_details(e: &RecomputeError) -> Option<serde_json::Value> {
    match e {
        RecomputeError::ConfigurationIntegrity(inner) => Some(json!({ "itemId": inner.item_id() })),
        _ => None,
    }
}
