use crate::auth::{Caller, Role};
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{create_trainer, NewTrainer};
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;

const TRAINER_SELECT: &str = "SELECT
       t.id, t.user_id, t.branch_id, t.employee_id, t.specialization, t.joined_on, t.active,
       u.full_name, u.email,
       (SELECT COUNT(*) FROM batches b WHERE b.trainer_id = t.id AND b.active = 1)
     FROM trainers t
     JOIN users u ON u.id = t.user_id
     WHERE 1 = 1";

fn trainer_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "branchId": r.get::<_, String>(2)?,
        "employeeId": r.get::<_, String>(3)?,
        "specialization": r.get::<_, Option<String>>(4)?,
        "joinedOn": r.get::<_, Option<String>>(5)?,
        "active": r.get::<_, i64>(6)? != 0,
        "fullName": r.get::<_, String>(7)?,
        "email": r.get::<_, String>(8)?,
        "activeBatchCount": r.get::<_, i64>(9)?,
    }))
}

fn get_trainer(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND t.id = ?", TRAINER_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("t.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), trainer_json)
        .optional()?
        .ok_or(AppError::NotFound("trainer"))
}

/// Trainer profile id for a TRAINER caller.
pub fn trainer_id_for_user(conn: &Connection, user_id: &str) -> AppResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM trainers WHERE user_id = ? AND active = 1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn list_trainers(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead, Role::Trainer])?;
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = TRAINER_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("t.branch_id", &mut sql, &mut binds);
    if let Some(branch_id) = get_opt_str(params, "branchId")? {
        sql.push_str(" AND t.branch_id = ?");
        binds.push(SqlValue::Text(branch_id.to_string()));
    }
    if !get_opt_bool(params, "includeInactive")?.unwrap_or(false) {
        sql.push_str(" AND t.active = 1");
    }
    sql.push_str(" ORDER BY u.full_name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), trainer_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "trainers": rows }))
}

fn trainer_detail(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "trainerId")?;
    Ok(json!({ "trainer": get_trainer(conn, &scope, id)? }))
}

fn create(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let branch_id = scope.write_branch(get_opt_str(params, "branchId")?)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;
    let created = create_trainer(
        conn,
        &NewTrainer {
            email: get_required_str(params, "email")?,
            password,
            full_name: get_required_str(params, "fullName")?,
            branch_id: &branch_id,
            employee_id: get_opt_str(params, "employeeId")?,
            specialization: get_opt_str(params, "specialization")?,
            joined_on: get_opt_str(params, "joinedOn")?,
        },
    )?;
    info!(trainer_id = %created.trainer_id, branch_id = %branch_id, "trainer created");
    Ok(json!({ "trainer": get_trainer(conn, &scope, &created.trainer_id)? }))
}

fn update(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "trainerId")?;
    let current = get_trainer(conn, &scope, id)?;
    let user_id = current["userId"].as_str().unwrap_or_default().to_string();
    let tx = conn.unchecked_transaction()?;
    if let Some(s) = get_opt_str(params, "specialization")? {
        tx.execute(
            "UPDATE trainers SET specialization = ? WHERE id = ?",
            (s, id),
        )?;
    }
    if let Some(name) = get_opt_str(params, "fullName")? {
        tx.execute(
            "UPDATE users SET full_name = ?, updated_at = ? WHERE id = ?",
            (name, crate::db::now_rfc3339(), &user_id),
        )?;
    }
    if let Some(active) = get_opt_bool(params, "active")? {
        tx.execute(
            "UPDATE trainers SET active = ? WHERE id = ?",
            (active as i64, id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "trainer": get_trainer(conn, &scope, id)? }))
}

fn handle_trainers_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_trainers)
}

fn handle_trainers_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, trainer_detail)
}

fn handle_trainers_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create)
}

fn handle_trainers_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "trainers.list" => Some(handle_trainers_list(state, req)),
        "trainers.get" => Some(handle_trainers_get(state, req)),
        "trainers.create" => Some(handle_trainers_create(state, req)),
        "trainers.update" => Some(handle_trainers_update(state, req)),
        _ => None,
    }
}
