use rusqlite::Connection;
use serde_json::Value;

use crate::auth::{self, Caller};
use crate::error::{AppError, AppResult};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};

/// Runs `f` against the open workspace without authentication.
pub fn with_conn<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> AppResult<Value>,
{
    let Some(conn) = state.db.as_ref() else {
        return fail(&req.id, &req.method, AppError::NoWorkspace);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => fail(&req.id, &req.method, e),
    }
}

/// Runs `f` for an authenticated caller. The token is re-checked against the store.
pub fn with_caller<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Caller, &Value) -> AppResult<Value>,
{
    let Some(conn) = state.db.as_ref() else {
        return fail(&req.id, &req.method, AppError::NoWorkspace);
    };
    let Some(token) = req.token.as_deref().filter(|t| !t.is_empty()) else {
        return fail(
            &req.id,
            &req.method,
            AppError::Unauthorized("missing token".to_string()),
        );
    };
    let caller = match auth::authenticate(conn, token, &state.config.signing_secret) {
        Ok(c) => c,
        Err(e) => return fail(&req.id, &req.method, e),
    };
    match f(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => fail(&req.id, &req.method, e),
    }
}

pub fn get_required_str<'a>(params: &'a Value, key: &str) -> AppResult<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str<'a>(params: &'a Value, key: &str) -> AppResult<Option<&'a str>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t) })
        }
        Some(_) => Err(AppError::bad_params(format!("{} must be string or null", key))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> AppResult<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_opt_f64(params: &Value, key: &str) -> AppResult<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be a non-negative number", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> AppResult<Option<bool>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_str_array<'a>(params: &'a Value, key: &str) -> AppResult<Vec<&'a str>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| AppError::bad_params(format!("{} must contain strings", key)))
            })
            .collect(),
        Some(_) => Err(AppError::bad_params(format!("{} must be an array", key))),
    }
}
