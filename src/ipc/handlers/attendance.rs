use crate::attendance::{
    self, parse_date, validate_period, AttendanceKey, AttendanceStatus,
};
use crate::auth::{Caller, Role};
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup::attendance_policy;
use crate::ipc::handlers::students::push_student_visibility;
use crate::ipc::helpers::{get_opt_i64, get_opt_str, get_required_str, get_str_array, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::scope::BranchScope;
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

const MARKERS: &[Role] = &[Role::Ceo, Role::BranchHead, Role::Trainer];

fn check_date(conn: &Connection, raw: &str) -> AppResult<NaiveDate> {
    let date = parse_date(raw, "date")?;
    let policy = attendance_policy(conn)?;
    if !policy.allow_future_dates && date > chrono::Local::now().date_naive() {
        return Err(AppError::bad_params("attendance cannot be marked for a future date"));
    }
    Ok(date)
}

fn check_period(conn: &Connection, params: &Value) -> AppResult<u32> {
    let period = get_opt_i64(params, "period")?
        .ok_or_else(|| AppError::bad_params("missing period"))?;
    validate_period(period, attendance_policy(conn)?.periods_per_day)
}

fn parse_status(params: &Value) -> AppResult<AttendanceStatus> {
    AttendanceStatus::parse(get_required_str(params, "status")?)
        .ok_or_else(|| AppError::bad_params("status must be PRESENT or ABSENT"))
}

/// Trainers mark only the batches they run; `trainer_user` is the batch trainer's user id.
fn check_batch_trainer(caller: &Caller, trainer_user: Option<&str>) -> AppResult<()> {
    if caller.role == Role::Trainer && trainer_user != Some(caller.user_id.as_str()) {
        return Err(AppError::forbidden("only the batch trainer can mark this batch"));
    }
    Ok(())
}

/// Builds the key for a single mark after checking the student is visible and enrolled.
fn single_key(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<AttendanceKey> {
    let scope = BranchScope::for_caller(caller)?;
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let student: Option<(String, String, i64, Option<String>)> = conn
        .query_row(
            "SELECT s.branch_id, s.course_id, s.active, t.user_id
             FROM students s
             LEFT JOIN batches b ON b.id = s.batch_id
             LEFT JOIN trainers t ON t.id = b.trainer_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((branch_id, enrolled_course, active, trainer_user)) =
        student.filter(|(b, _, _, _)| scope.allows(b))
    else {
        return Err(AppError::NotFound("student"));
    };
    check_batch_trainer(caller, trainer_user.as_deref())?;
    if enrolled_course != course_id {
        return Err(AppError::bad_params("student is not enrolled in this course"));
    }
    if active == 0 {
        return Err(AppError::bad_params("student is inactive"));
    }
    debug!(student_id, branch_id = %branch_id, "attendance key resolved");
    Ok(AttendanceKey {
        student_id: student_id.to_string(),
        course_id: course_id.to_string(),
        date: check_date(conn, get_required_str(params, "date")?)?,
        period: check_period(conn, params)?,
    })
}

fn mark(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(MARKERS)?;
    let key = single_key(conn, caller, params)?;
    let status = parse_status(params)?;
    let outcome = attendance::upsert(conn, &key, status, &caller.user_id)?;
    Ok(json!({
        "id": outcome.id,
        "created": outcome.created,
        "status": status.as_str(),
    }))
}

fn create(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(MARKERS)?;
    let key = single_key(conn, caller, params)?;
    let status = parse_status(params)?;
    match attendance::insert_strict(conn, &key, status, &caller.user_id) {
        Ok(id) => Ok(json!({ "id": id, "status": status.as_str() })),
        Err(e) if e.is_unique_violation() => {
            let existing = attendance::find_by_key(conn, &key)?.map(|(id, _)| id);
            debug!(
                student_id = %key.student_id,
                period = key.period,
                existing = ?existing,
                "attendance already recorded; caller should retry with attendance.mark"
            );
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn bulk_mark(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(MARKERS)?;
    let scope = BranchScope::for_caller(caller)?;
    let batch_id = get_required_str(params, "batchId")?;
    let batch: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT b.branch_id, b.course_id, t.user_id
             FROM batches b LEFT JOIN trainers t ON t.id = b.trainer_id
             WHERE b.id = ?",
            [batch_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((_, course_id, trainer_user)) = batch.filter(|(b, _, _)| scope.allows(b)) else {
        return Err(AppError::NotFound("batch"));
    };
    check_batch_trainer(caller, trainer_user.as_deref())?;
    let date = check_date(conn, get_required_str(params, "date")?)?;
    let period = check_period(conn, params)?;
    let absent: HashSet<&str> = get_str_array(params, "absentStudentIds")?.into_iter().collect();

    let tx = conn.unchecked_transaction()?;
    let student_ids = {
        let mut stmt = tx.prepare(
            "SELECT id FROM students WHERE batch_id = ? AND course_id = ? AND active = 1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map((batch_id, &course_id), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    let unknown: Vec<&str> = absent
        .iter()
        .copied()
        .filter(|id| !student_ids.iter().any(|s| s == id))
        .collect();
    if !unknown.is_empty() {
        return Err(AppError::bad_params(format!(
            "absentStudentIds not in batch: {}",
            unknown.join(", ")
        )));
    }

    let mut created = 0usize;
    let mut updated = 0usize;
    for student_id in &student_ids {
        let status = if absent.contains(student_id.as_str()) {
            AttendanceStatus::Absent
        } else {
            AttendanceStatus::Present
        };
        let key = AttendanceKey {
            student_id: student_id.clone(),
            course_id: course_id.clone(),
            date,
            period,
        };
        if attendance::upsert(&tx, &key, status, &caller.user_id)?.created {
            created += 1;
        } else {
            updated += 1;
        }
    }
    tx.commit()?;
    info!(batch_id, %date, period, created, updated, "batch attendance marked");
    Ok(json!({
        "batchId": batch_id,
        "date": date.format("%Y-%m-%d").to_string(),
        "period": period,
        "created": created,
        "updated": updated,
        "absent": absent.len(),
    }))
}

fn verify(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let ids = get_str_array(params, "attendanceIds")?;
    if ids.is_empty() {
        return Err(AppError::bad_params("attendanceIds must not be empty"));
    }
    let tx = conn.unchecked_transaction()?;
    let mut verified = 0usize;
    for id in &ids {
        let mut sql = "UPDATE attendance SET verified = 1
             WHERE id = ? AND student_id IN (SELECT s.id FROM students s WHERE 1 = 1"
            .to_string();
        let mut binds = vec![SqlValue::Text(id.to_string())];
        scope.push_clause("s.branch_id", &mut sql, &mut binds);
        sql.push(')');
        verified += tx.execute(&sql, params_from_iter(binds))?;
    }
    tx.commit()?;
    Ok(json!({ "verified": verified, "requested": ids.len() }))
}

/// Shared WHERE for list/summary: visibility plus the optional filters.
fn filtered_rows_sql(
    caller: &Caller,
    params: &Value,
    sql: &mut String,
    binds: &mut Vec<SqlValue>,
) -> AppResult<()> {
    let scope = BranchScope::for_caller(caller)?;
    push_student_visibility(caller, &scope, "s", sql, binds);
    for (key, column) in [
        ("studentId", "at.student_id"),
        ("courseId", "at.course_id"),
        ("batchId", "s.batch_id"),
    ] {
        if let Some(v) = get_opt_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    let from = get_opt_str(params, "from")?.map(|d| parse_date(d, "from")).transpose()?;
    let to = get_opt_str(params, "to")?.map(|d| parse_date(d, "to")).transpose()?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(AppError::bad_params("from must not be after to"));
        }
    }
    if let Some(f) = from {
        sql.push_str(" AND at.date >= ?");
        binds.push(SqlValue::Text(f.format("%Y-%m-%d").to_string()));
    }
    if let Some(t) = to {
        sql.push_str(" AND at.date <= ?");
        binds.push(SqlValue::Text(t.format("%Y-%m-%d").to_string()));
    }
    Ok(())
}

fn list(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let mut sql = "SELECT at.id, at.student_id, at.course_id, at.date, at.period, at.status,
                at.verified, at.marked_by, u.full_name
         FROM attendance at
         JOIN students s ON s.id = at.student_id
         JOIN users u ON u.id = s.user_id
         WHERE 1 = 1"
        .to_string();
    let mut binds = Vec::new();
    filtered_rows_sql(caller, params, &mut sql, &mut binds)?;
    if let Some(period) = get_opt_i64(params, "period")? {
        sql.push_str(" AND at.period = ?");
        binds.push(SqlValue::Integer(period));
    }
    sql.push_str(" ORDER BY at.date DESC, at.period, u.full_name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "courseId": r.get::<_, String>(2)?,
                "date": r.get::<_, String>(3)?,
                "period": r.get::<_, i64>(4)?,
                "status": r.get::<_, String>(5)?,
                "verified": r.get::<_, i64>(6)? != 0,
                "markedBy": r.get::<_, Option<String>>(7)?,
                "studentName": r.get::<_, String>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "attendance": rows }))
}

pub fn present_rate(present: i64, total: i64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(((present as f64 / total as f64) * 1000.0).round() / 10.0)
}

fn summary(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let mut sql = "SELECT at.student_id, u.full_name,
                SUM(CASE WHEN at.status = 'PRESENT' THEN 1 ELSE 0 END),
                SUM(CASE WHEN at.status = 'ABSENT' THEN 1 ELSE 0 END)
         FROM attendance at
         JOIN students s ON s.id = at.student_id
         JOIN users u ON u.id = s.user_id
         WHERE 1 = 1"
        .to_string();
    let mut binds = Vec::new();
    filtered_rows_sql(caller, params, &mut sql, &mut binds)?;
    sql.push_str(" GROUP BY at.student_id, u.full_name ORDER BY u.full_name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let present: i64 = r.get(2)?;
            let absent: i64 = r.get(3)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "present": present,
                "absent": absent,
                "percentage": present_rate(present, present + absent),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": rows }))
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, mark)
}

fn handle_attendance_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create)
}

fn handle_attendance_bulk_mark(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, bulk_mark)
}

fn handle_attendance_verify(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, verify)
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list)
}

fn handle_attendance_summary(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, summary)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.create" => Some(handle_attendance_create(state, req)),
        "attendance.bulkMark" => Some(handle_attendance_bulk_mark(state, req)),
        "attendance.verify" => Some(handle_attendance_verify(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        "attendance.summary" => Some(handle_attendance_summary(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_rate_rounds_to_one_decimal() {
        assert_eq!(present_rate(0, 0), None);
        assert_eq!(present_rate(2, 3), Some(66.7));
        assert_eq!(present_rate(5, 5), Some(100.0));
    }
}
