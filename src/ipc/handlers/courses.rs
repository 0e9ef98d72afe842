use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_f64, get_opt_i64, get_opt_str, get_required_str, with_caller,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const COURSE_SELECT: &str = "SELECT
       c.id, c.branch_id, c.code, c.name, c.duration_weeks, c.fee, c.active,
       (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id AND s.active = 1)
     FROM courses c
     WHERE 1 = 1";

fn course_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "branchId": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "name": r.get::<_, String>(3)?,
        "durationWeeks": r.get::<_, Option<i64>>(4)?,
        "fee": r.get::<_, Option<f64>>(5)?,
        "active": r.get::<_, i64>(6)? != 0,
        "studentCount": r.get::<_, i64>(7)?,
    }))
}

pub fn get_course(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND c.id = ?", COURSE_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("c.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), course_json)
        .optional()?
        .ok_or(AppError::NotFound("course"))
}

/// Branch owning a course, if the caller may see it.
pub fn course_branch(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<String> {
    let branch: Option<String> = conn
        .query_row("SELECT branch_id FROM courses WHERE id = ?", [id], |r| {
            r.get(0)
        })
        .optional()?;
    match branch {
        Some(b) if scope.allows(&b) => Ok(b),
        _ => Err(AppError::NotFound("course")),
    }
}

fn list_courses(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = COURSE_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("c.branch_id", &mut sql, &mut binds);
    if let Some(branch_id) = get_opt_str(params, "branchId")? {
        sql.push_str(" AND c.branch_id = ?");
        binds.push(SqlValue::Text(branch_id.to_string()));
    }
    if !get_opt_bool(params, "includeInactive")?.unwrap_or(false) {
        sql.push_str(" AND c.active = 1");
    }
    sql.push_str(" ORDER BY c.code");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), course_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": rows }))
}

fn parse_weeks(params: &Value) -> AppResult<Option<i64>> {
    let weeks = get_opt_i64(params, "durationWeeks")?;
    if let Some(w) = weeks {
        if !(1..=260).contains(&w) {
            return Err(AppError::bad_params("durationWeeks must be in 1..=260"));
        }
    }
    Ok(weeks)
}

fn create_course(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let branch_id = scope.write_branch(get_opt_str(params, "branchId")?)?;
    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, branch_id, code, name, duration_weeks, fee, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &branch_id,
            &code,
            name,
            parse_weeks(params)?,
            get_opt_f64(params, "fee")?,
            now_rfc3339(),
        ),
    )?;
    Ok(json!({ "course": get_course(conn, &scope, &id)? }))
}

fn update_course(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "courseId")?;
    course_branch(conn, &scope, id)?;
    let tx = conn.unchecked_transaction()?;
    if let Some(name) = get_opt_str(params, "name")? {
        tx.execute("UPDATE courses SET name = ? WHERE id = ?", (name, id))?;
    }
    if let Some(weeks) = parse_weeks(params)? {
        tx.execute(
            "UPDATE courses SET duration_weeks = ? WHERE id = ?",
            (weeks, id),
        )?;
    }
    if let Some(fee) = get_opt_f64(params, "fee")? {
        tx.execute("UPDATE courses SET fee = ? WHERE id = ?", (fee, id))?;
    }
    if let Some(active) = get_opt_bool(params, "active")? {
        tx.execute(
            "UPDATE courses SET active = ? WHERE id = ?",
            (active as i64, id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "course": get_course(conn, &scope, id)? }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_courses)
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create_course)
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update_course)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        _ => None,
    }
}
