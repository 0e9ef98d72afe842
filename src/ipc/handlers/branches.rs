use crate::auth::Role;
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::scope::BranchScope;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

/// Branch codes are stored upper-case; lookups compare the canonical form only.
pub fn normalize_branch_code(raw: &str) -> AppResult<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty()
        || code.len() > 16
        || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(AppError::bad_params(
            "code must be 1-16 letters, digits or dashes",
        ));
    }
    Ok(code)
}

fn branch_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "active": r.get::<_, i64>(3)? != 0,
        "studentCount": r.get::<_, i64>(4)?,
        "trainerCount": r.get::<_, i64>(5)?,
    }))
}

const BRANCH_SELECT: &str = "SELECT
       b.id, b.name, b.code, b.active,
       (SELECT COUNT(*) FROM students s WHERE s.branch_id = b.id AND s.active = 1),
       (SELECT COUNT(*) FROM trainers t WHERE t.branch_id = b.id AND t.active = 1)
     FROM branches b
     WHERE 1 = 1";

fn list_branches(conn: &Connection, scope: &BranchScope) -> AppResult<Value> {
    let mut sql = BRANCH_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("b.id", &mut sql, &mut binds);
    sql.push_str(" ORDER BY b.name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), branch_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "branches": rows }))
}

pub fn get_branch(conn: &Connection, id: &str) -> AppResult<Value> {
    let sql = format!("{} AND b.id = ?", BRANCH_SELECT);
    conn.query_row(&sql, [id], branch_json)
        .optional()?
        .ok_or(AppError::NotFound("branch"))
}

fn create_branch(conn: &Connection, params: &Value) -> AppResult<Value> {
    let name = get_required_str(params, "name")?;
    let code = normalize_branch_code(get_required_str(params, "code")?)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO branches(id, name, code, active, created_at) VALUES(?, ?, ?, 1, ?)",
        (&id, name, &code, now_rfc3339()),
    )?;
    get_branch(conn, &id)
}

fn update_branch(conn: &Connection, params: &Value) -> AppResult<Value> {
    let id = get_required_str(params, "branchId")?;
    get_branch(conn, id)?;
    let tx = conn.unchecked_transaction()?;
    if let Some(name) = get_opt_str(params, "name")? {
        tx.execute("UPDATE branches SET name = ? WHERE id = ?", (name, id))?;
    }
    if let Some(code) = get_opt_str(params, "code")? {
        let code = normalize_branch_code(code)?;
        tx.execute("UPDATE branches SET code = ? WHERE id = ?", (&code, id))?;
    }
    if let Some(active) = get_opt_bool(params, "active")? {
        tx.execute(
            "UPDATE branches SET active = ? WHERE id = ?",
            (active as i64, id),
        )?;
    }
    tx.commit()?;
    get_branch(conn, id)
}

fn handle_branches_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |conn, caller, _| {
        list_branches(conn, &BranchScope::for_caller(caller)?)
    })
}

fn handle_branches_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |conn, caller, params| {
        caller.require(&[Role::Ceo])?;
        Ok(json!({ "branch": create_branch(conn, params)? }))
    })
}

fn handle_branches_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |conn, caller, params| {
        caller.require(&[Role::Ceo])?;
        Ok(json!({ "branch": update_branch(conn, params)? }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "branches.list" => Some(handle_branches_list(state, req)),
        "branches.create" => Some(handle_branches_create(state, req)),
        "branches.update" => Some(handle_branches_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_codes_are_canonical() {
        assert_eq!(normalize_branch_code(" fc-slm ").expect("code"), "FC-SLM");
        assert!(normalize_branch_code("salem branch").is_err());
        assert!(normalize_branch_code("").is_err());
    }
}
