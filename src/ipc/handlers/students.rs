use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{enroll_student, EnrollStudent};
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const STUDENT_SELECT: &str = "SELECT
       s.id, s.user_id, s.admission_id, s.branch_id, s.course_id, s.batch_id,
       s.enrolled_on, s.active, u.full_name, u.email, a.admission_no, a.phone
     FROM students s
     JOIN users u ON u.id = s.user_id
     JOIN admissions a ON a.id = s.admission_id
     WHERE 1 = 1";

fn student_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "admissionId": r.get::<_, String>(2)?,
        "branchId": r.get::<_, String>(3)?,
        "courseId": r.get::<_, String>(4)?,
        "batchId": r.get::<_, Option<String>>(5)?,
        "enrolledOn": r.get::<_, String>(6)?,
        "active": r.get::<_, i64>(7)? != 0,
        "fullName": r.get::<_, String>(8)?,
        "email": r.get::<_, String>(9)?,
        "admissionNo": r.get::<_, String>(10)?,
        "phone": r.get::<_, Option<String>>(11)?,
    }))
}

/// Narrows a student query to what the caller may read: branch scope, and only
/// themselves for STUDENT callers.
pub fn push_student_visibility(
    caller: &Caller,
    scope: &BranchScope,
    student_alias: &str,
    sql: &mut String,
    binds: &mut Vec<SqlValue>,
) {
    scope.push_clause(&format!("{}.branch_id", student_alias), sql, binds);
    if caller.role == Role::Student {
        sql.push_str(&format!(" AND {}.user_id = ?", student_alias));
        binds.push(SqlValue::Text(caller.user_id.clone()));
    }
}

fn get_student(conn: &Connection, caller: &Caller, id: &str) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = format!("{} AND s.id = ?", STUDENT_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    push_student_visibility(caller, &scope, "s", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), student_json)
        .optional()?
        .ok_or(AppError::NotFound("student"))
}

fn list_students(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = STUDENT_SELECT.to_string();
    let mut binds = Vec::new();
    push_student_visibility(caller, &scope, "s", &mut sql, &mut binds);
    for (key, column) in [
        ("branchId", "s.branch_id"),
        ("courseId", "s.course_id"),
        ("batchId", "s.batch_id"),
    ] {
        if let Some(v) = get_opt_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    if let Some(active) = get_opt_bool(params, "active")? {
        sql.push_str(" AND s.active = ?");
        binds.push(SqlValue::Integer(active as i64));
    }
    if let Some(q) = get_opt_str(params, "search")? {
        sql.push_str(" AND (u.full_name LIKE ? OR u.email LIKE ? OR a.admission_no LIKE ?)");
        let pattern = format!("%{}%", q);
        for _ in 0..3 {
            binds.push(SqlValue::Text(pattern.clone()));
        }
    }
    sql.push_str(" ORDER BY u.full_name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), student_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": rows }))
}

fn student_detail(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let id = get_required_str(params, "studentId")?;
    Ok(json!({ "student": get_student(conn, caller, id)? }))
}

fn enroll(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;
    let enrolled = enroll_student(
        conn,
        &scope,
        &EnrollStudent {
            admission_id: get_required_str(params, "admissionId")?,
            email: get_opt_str(params, "email")?,
            password,
            batch_id: get_opt_str(params, "batchId")?,
        },
    )?;
    Ok(json!({ "student": get_student(conn, caller, &enrolled.student_id)? }))
}

fn update(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let id = get_required_str(params, "studentId")?;
    let current = get_student(conn, caller, id)?;
    let user_id = current["userId"].as_str().unwrap_or_default().to_string();
    let admission_id = current["admissionId"].as_str().unwrap_or_default().to_string();
    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    if let Some(name) = get_opt_str(params, "fullName")? {
        tx.execute(
            "UPDATE users SET full_name = ?, updated_at = ? WHERE id = ?",
            (name, &now, &user_id),
        )?;
        tx.execute(
            "UPDATE admissions SET full_name = ?, updated_at = ? WHERE id = ?",
            (name, &now, &admission_id),
        )?;
    }
    if let Some(phone) = get_opt_str(params, "phone")? {
        tx.execute(
            "UPDATE admissions SET phone = ?, updated_at = ? WHERE id = ?",
            (phone, &now, &admission_id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "student": get_student(conn, caller, id)? }))
}

fn set_active(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let id = get_required_str(params, "studentId")?;
    let active = get_opt_bool(params, "active")?
        .ok_or_else(|| AppError::bad_params("missing active"))?;
    let current = get_student(conn, caller, id)?;
    let user_id = current["userId"].as_str().unwrap_or_default().to_string();
    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    tx.execute(
        "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, &now, id),
    )?;
    tx.execute(
        "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, &now, &user_id),
    )?;
    tx.commit()?;
    Ok(json!({ "student": get_student(conn, caller, id)? }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_students)
}

fn handle_students_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, student_detail)
}

fn handle_students_enroll(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, enroll)
}

fn handle_students_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update)
}

fn handle_students_set_active(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, set_active)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.setActive" => Some(handle_students_set_active(state, req)),
        _ => None,
    }
}
