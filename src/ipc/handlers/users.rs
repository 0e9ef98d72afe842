use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{insert_user, NewUser};
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;

const USER_SELECT: &str = "SELECT
       u.id, u.email, u.full_name, u.role, u.branch_id, u.active,
       EXISTS(SELECT 1 FROM students s WHERE s.user_id = u.id),
       EXISTS(SELECT 1 FROM trainers t WHERE t.user_id = u.id)
     FROM users u
     WHERE 1 = 1";

fn user_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let role: String = r.get(3)?;
    let has_profile = match role.as_str() {
        "STUDENT" => Some(r.get::<_, i64>(6)? != 0),
        "TRAINER" => Some(r.get::<_, i64>(7)? != 0),
        _ => None,
    };
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "email": r.get::<_, String>(1)?,
        "fullName": r.get::<_, String>(2)?,
        "role": role,
        "branchId": r.get::<_, Option<String>>(4)?,
        "active": r.get::<_, i64>(5)? != 0,
        "hasProfile": has_profile,
    }))
}

fn get_user(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND u.id = ?", USER_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("u.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), user_json)
        .optional()?
        .ok_or(AppError::NotFound("user"))
}

fn list_users(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = USER_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("u.branch_id", &mut sql, &mut binds);
    if let Some(role) = get_opt_str(params, "role")? {
        let role = Role::parse(role).ok_or_else(|| AppError::bad_params("unknown role"))?;
        sql.push_str(" AND u.role = ?");
        binds.push(SqlValue::Text(role.as_str().to_string()));
    }
    if let Some(branch_id) = get_opt_str(params, "branchId")? {
        sql.push_str(" AND u.branch_id = ?");
        binds.push(SqlValue::Text(branch_id.to_string()));
    }
    sql.push_str(" ORDER BY u.email");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), user_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": rows }))
}

fn create_user(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo])?;
    let role = Role::parse(get_required_str(params, "role")?)
        .ok_or_else(|| AppError::bad_params("unknown role"))?;
    match role {
        Role::Student => {
            return Err(AppError::bad_params(
                "student accounts are created through students.enroll",
            ))
        }
        Role::Trainer => {
            return Err(AppError::bad_params(
                "trainer accounts are created through trainers.create",
            ))
        }
        Role::Ceo | Role::BranchHead => {}
    }
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;
    let id = insert_user(
        conn,
        &NewUser {
            email: get_required_str(params, "email")?,
            password,
            full_name: get_required_str(params, "fullName")?,
            role,
            branch_id: get_opt_str(params, "branchId")?,
        },
    )?;
    info!(user_id = %id, role = role.as_str(), "user created");
    Ok(json!({ "user": get_user(conn, &BranchScope::All, &id)? }))
}

fn set_user_active(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let user_id = get_required_str(params, "userId")?;
    let active = get_opt_bool(params, "active")?
        .ok_or_else(|| AppError::bad_params("missing active"))?;
    if user_id == caller.user_id {
        return Err(AppError::bad_params("cannot change your own active flag"));
    }
    let target = get_user(conn, &scope, user_id)?;
    let target_role = target.get("role").and_then(|v| v.as_str()).unwrap_or("");
    if !caller.is_ceo() && (target_role == "CEO" || target_role == "BRANCH_HEAD") {
        return Err(AppError::forbidden("branch heads manage trainers and students only"));
    }
    conn.execute(
        "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, now_rfc3339(), user_id),
    )?;
    Ok(json!({ "user": get_user(conn, &scope, user_id)? }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_users)
}

fn handle_users_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create_user)
}

fn handle_users_set_active(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, set_user_active)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.setActive" => Some(handle_users_set_active(state, req)),
        _ => None,
    }
}
