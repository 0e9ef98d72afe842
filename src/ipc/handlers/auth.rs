use crate::auth::{self, Caller, Role, TokenClaims};
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_required_str, with_caller, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::profiles::normalize_email;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

struct LoginRow {
    id: String,
    password_hash: String,
    role: String,
    branch_id: Option<String>,
    active: bool,
}

/// Checks an email/password pair. Unknown email and wrong password are indistinguishable.
pub fn verify_credentials(conn: &Connection, email: &str, password: &str) -> AppResult<Caller> {
    let email = normalize_email(email)?;
    let row = conn
        .query_row(
            "SELECT id, password_hash, role, branch_id, active FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok(LoginRow {
                    id: r.get(0)?,
                    password_hash: r.get(1)?,
                    role: r.get(2)?,
                    branch_id: r.get(3)?,
                    active: r.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()?;
    let bad = || AppError::Unauthorized("invalid email or password".to_string());
    let Some(row) = row else {
        warn!(email = %email, "login for unknown email");
        return Err(bad());
    };
    if !auth::verify_password(password, &row.password_hash) {
        warn!(email = %email, "login with wrong password");
        return Err(bad());
    }
    if !row.active {
        return Err(AppError::Unauthorized("account is inactive".to_string()));
    }
    let role = Role::parse(&row.role)
        .ok_or_else(|| anyhow::anyhow!("user {} has unknown role {}", row.id, row.role))?;
    Ok(Caller {
        user_id: row.id,
        email,
        full_name: String::new(),
        role,
        branch_id: row.branch_id,
    })
}

pub fn caller_json(caller: &Caller) -> Value {
    json!({
        "id": caller.user_id,
        "email": caller.email,
        "fullName": caller.full_name,
        "role": caller.role.as_str(),
        "branchId": caller.branch_id,
    })
}

fn login(state: &AppState, conn: &Connection, params: &Value) -> AppResult<Value> {
    let email = get_required_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;
    let verified = verify_credentials(conn, email, password)?;
    let caller = auth::load_caller(conn, &verified.user_id)?
        .map(|(c, _)| c)
        .ok_or(AppError::NotFound("user"))?;

    let now = chrono::Utc::now().timestamp();
    let exp = now + state.config.token_ttl_minutes * 60;
    let token = auth::issue_token(
        &TokenClaims {
            sub: caller.user_id.clone(),
            role: caller.role,
            branch_id: caller.branch_id.clone(),
            iat: now,
            exp,
        },
        &state.config.signing_secret,
    )?;
    info!(user_id = %caller.user_id, role = caller.role.as_str(), "login");
    Ok(json!({
        "token": token,
        "expiresAt": exp,
        "user": caller_json(&caller),
    }))
}

fn handle_login(state: &mut AppState, req: &Request) -> Value {
    let state = &*state;
    with_conn(state, req, |conn, params| login(state, conn, params))
}

fn handle_me(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |_, caller, _| Ok(json!({ "user": caller_json(caller) })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.me" => Some(handle_me(state, req)),
        _ => None,
    }
}
