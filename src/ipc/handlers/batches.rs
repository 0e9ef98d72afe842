use crate::attendance::parse_date;
use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::courses::course_branch;
use crate::ipc::handlers::students::push_student_visibility;
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::check_batch_fits;
use crate::scope::BranchScope;
use chrono::NaiveTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const BATCH_SELECT: &str = "SELECT
       b.id, b.branch_id, b.course_id, b.trainer_id, b.name, b.start_time, b.end_time,
       b.start_date, b.active,
       (SELECT COUNT(*) FROM students s WHERE s.batch_id = b.id AND s.active = 1)
     FROM batches b
     WHERE 1 = 1";

fn batch_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "branchId": r.get::<_, String>(1)?,
        "courseId": r.get::<_, String>(2)?,
        "trainerId": r.get::<_, Option<String>>(3)?,
        "name": r.get::<_, String>(4)?,
        "startTime": r.get::<_, String>(5)?,
        "endTime": r.get::<_, String>(6)?,
        "startDate": r.get::<_, Option<String>>(7)?,
        "active": r.get::<_, i64>(8)? != 0,
        "studentCount": r.get::<_, i64>(9)?,
    }))
}

pub fn parse_time(raw: &str, key: &str) -> AppResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| AppError::bad_params(format!("{} must be HH:MM", key)))
}

fn check_schedule(start: &str, end: &str) -> AppResult<(String, String)> {
    let s = parse_time(start, "startTime")?;
    let e = parse_time(end, "endTime")?;
    if s >= e {
        return Err(AppError::bad_params("startTime must be before endTime"));
    }
    Ok((s.format("%H:%M").to_string(), e.format("%H:%M").to_string()))
}

fn get_batch(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND b.id = ?", BATCH_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("b.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), batch_json)
        .optional()?
        .ok_or(AppError::NotFound("batch"))
}

fn check_trainer_branch(conn: &Connection, trainer_id: &str, branch_id: &str) -> AppResult<()> {
    let b: Option<String> = conn
        .query_row(
            "SELECT branch_id FROM trainers WHERE id = ?",
            [trainer_id],
            |r| r.get(0),
        )
        .optional()?;
    match b {
        Some(b) if b == branch_id => Ok(()),
        Some(_) => Err(AppError::bad_params("trainer belongs to another branch")),
        None => Err(AppError::NotFound("trainer")),
    }
}

fn list_batches(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = BATCH_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("b.branch_id", &mut sql, &mut binds);
    for (key, column) in [
        ("branchId", "b.branch_id"),
        ("courseId", "b.course_id"),
        ("trainerId", "b.trainer_id"),
    ] {
        if let Some(v) = get_opt_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    if caller.role == Role::Trainer {
        sql.push_str(" AND b.trainer_id IN (SELECT t.id FROM trainers t WHERE t.user_id = ?)");
        binds.push(SqlValue::Text(caller.user_id.clone()));
    }
    sql.push_str(" ORDER BY b.start_time, b.name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), batch_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "batches": rows }))
}

fn batch_detail(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "batchId")?;
    let batch = get_batch(conn, &scope, id)?;
    let mut sql = "SELECT s.id, u.full_name, u.email, s.active
         FROM students s JOIN users u ON u.id = s.user_id
         WHERE s.batch_id = ?"
        .to_string();
    let mut binds = vec![SqlValue::Text(id.to_string())];
    // Roster rows follow student visibility, so a student sees only their own entry.
    push_student_visibility(caller, &scope, "s", &mut sql, &mut binds);
    sql.push_str(" ORDER BY u.full_name");
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "active": r.get::<_, i64>(3)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "batch": batch, "students": students }))
}

fn create_batch(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let course_id = get_required_str(params, "courseId")?;
    let branch_id = course_branch(conn, &scope, course_id)?;
    let name = get_required_str(params, "name")?;
    let (start, end) = check_schedule(
        get_required_str(params, "startTime")?,
        get_required_str(params, "endTime")?,
    )?;
    let trainer_id = get_opt_str(params, "trainerId")?;
    if let Some(t) = trainer_id {
        check_trainer_branch(conn, t, &branch_id)?;
    }
    let start_date = match get_opt_str(params, "startDate")? {
        Some(d) => Some(parse_date(d, "startDate")?.format("%Y-%m-%d").to_string()),
        None => None,
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, branch_id, course_id, trainer_id, name, start_time, end_time, start_date, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &branch_id,
            course_id,
            trainer_id,
            name,
            &start,
            &end,
            &start_date,
            now_rfc3339(),
        ),
    )?;
    Ok(json!({ "batch": get_batch(conn, &scope, &id)? }))
}

fn update_batch(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "batchId")?;
    let current = get_batch(conn, &scope, id)?;
    let branch_id = current["branchId"].as_str().unwrap_or_default().to_string();

    let start = get_opt_str(params, "startTime")?
        .unwrap_or_else(|| current["startTime"].as_str().unwrap_or_default());
    let end = get_opt_str(params, "endTime")?
        .unwrap_or_else(|| current["endTime"].as_str().unwrap_or_default());
    let (start, end) = check_schedule(start, end)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE batches SET start_time = ?, end_time = ? WHERE id = ?",
        (&start, &end, id),
    )?;
    if let Some(name) = get_opt_str(params, "name")? {
        tx.execute("UPDATE batches SET name = ? WHERE id = ?", (name, id))?;
    }
    match params.get("trainerId") {
        Some(Value::Null) => {
            tx.execute("UPDATE batches SET trainer_id = NULL WHERE id = ?", [id])?;
        }
        Some(_) => {
            if let Some(t) = get_opt_str(params, "trainerId")? {
                check_trainer_branch(&tx, t, &branch_id)?;
                tx.execute("UPDATE batches SET trainer_id = ? WHERE id = ?", (t, id))?;
            }
        }
        None => {}
    }
    if let Some(active) = get_opt_bool(params, "active")? {
        tx.execute(
            "UPDATE batches SET active = ? WHERE id = ?",
            (active as i64, id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "batch": get_batch(conn, &scope, id)? }))
}

fn assign_student(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let student_id = get_required_str(params, "studentId")?;
    let batch_id = get_opt_str(params, "batchId")?;
    let student: Option<(String, String)> = conn
        .query_row(
            "SELECT branch_id, course_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((branch_id, course_id)) = student.filter(|(b, _)| scope.allows(b)) else {
        return Err(AppError::NotFound("student"));
    };
    if let Some(b) = batch_id {
        check_batch_fits(conn, b, &branch_id, &course_id)?;
    }
    conn.execute(
        "UPDATE students SET batch_id = ?, updated_at = ? WHERE id = ?",
        (batch_id, now_rfc3339(), student_id),
    )?;
    Ok(json!({ "studentId": student_id, "batchId": batch_id }))
}

fn handle_batches_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_batches)
}

fn handle_batches_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, batch_detail)
}

fn handle_batches_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create_batch)
}

fn handle_batches_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update_batch)
}

fn handle_batches_assign_student(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, assign_student)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.get" => Some(handle_batches_get(state, req)),
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.update" => Some(handle_batches_update(state, req)),
        "batches.assignStudent" => Some(handle_batches_assign_student(state, req)),
        _ => None,
    }
}
