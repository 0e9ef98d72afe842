use serde_json::json;
use tracing::{debug, warn};

use crate::error::AppError;

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

pub fn fail(id: &str, method: &str, e: AppError) -> serde_json::Value {
    match &e {
        AppError::Db(_) | AppError::Internal(_) => {
            warn!(method, code = e.code(), error = %e, "request failed")
        }
        _ => debug!(method, code = e.code(), error = %e, "request rejected"),
    }
    err(id, e.code(), e.to_string(), e.details())
}
