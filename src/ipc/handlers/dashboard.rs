use crate::attendance::parse_date;
use crate::auth::{Caller, Role};
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::attendance::present_rate;
use crate::ipc::helpers::{get_opt_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::scope::BranchScope;
use chrono::{Duration, NaiveDate};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Value};

fn scoped_count(
    conn: &Connection,
    scope: &BranchScope,
    base: &str,
    column: &str,
) -> AppResult<i64> {
    let mut sql = base.to_string();
    let mut binds = Vec::new();
    scope.push_clause(column, &mut sql, &mut binds);
    Ok(conn.query_row(&sql, params_from_iter(binds), |r| r.get(0))?)
}

/// `{status: count}` over every status value in `statuses`, zero-filled.
fn counts_by_status(
    conn: &Connection,
    scope: &BranchScope,
    table: &str,
    statuses: &[&str],
) -> AppResult<Value> {
    let mut sql = format!("SELECT status, COUNT(*) FROM {} WHERE 1 = 1", table);
    let mut binds = Vec::new();
    scope.push_clause("branch_id", &mut sql, &mut binds);
    sql.push_str(" GROUP BY status");
    let mut out = Map::new();
    for s in statuses {
        out.insert(s.to_string(), json!(0));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (status, n) in rows {
        out.insert(status, json!(n));
    }
    Ok(Value::Object(out))
}

fn present_absent(
    conn: &Connection,
    scope: &BranchScope,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<(i64, i64)> {
    let mut sql = "SELECT
            COALESCE(SUM(CASE WHEN at.status = 'PRESENT' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN at.status = 'ABSENT' THEN 1 ELSE 0 END), 0)
         FROM attendance at JOIN students s ON s.id = at.student_id
         WHERE at.date >= ? AND at.date <= ?"
        .to_string();
    let mut binds = vec![
        SqlValue::Text(from.format("%Y-%m-%d").to_string()),
        SqlValue::Text(to.format("%Y-%m-%d").to_string()),
    ];
    scope.push_clause("s.branch_id", &mut sql, &mut binds);
    Ok(conn.query_row(&sql, params_from_iter(binds), |r| {
        Ok((r.get(0)?, r.get(1)?))
    })?)
}

fn kpis(conn: &Connection, caller: &Caller, _params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let today = chrono::Local::now().date_naive();
    let (present, absent) = present_absent(conn, &scope, today, today)?;
    Ok(json!({
        "branches": scoped_count(conn, &scope, "SELECT COUNT(*) FROM branches WHERE active = 1", "id")?,
        "activeStudents": scoped_count(conn, &scope, "SELECT COUNT(*) FROM students WHERE active = 1", "branch_id")?,
        "activeTrainers": scoped_count(conn, &scope, "SELECT COUNT(*) FROM trainers WHERE active = 1", "branch_id")?,
        "activeBatches": scoped_count(conn, &scope, "SELECT COUNT(*) FROM batches WHERE active = 1", "branch_id")?,
        "activeCourses": scoped_count(conn, &scope, "SELECT COUNT(*) FROM courses WHERE active = 1", "branch_id")?,
        "leadsByStatus": counts_by_status(
            conn,
            &scope,
            "leads",
            &["NEW", "CONTACTED", "INTERESTED", "CONVERTED", "LOST"],
        )?,
        "admissionsByStatus": counts_by_status(
            conn,
            &scope,
            "admissions",
            &["NEW", "APPROVED", "REJECTED", "ENROLLED"],
        )?,
        "todayAttendance": {
            "date": today.format("%Y-%m-%d").to_string(),
            "present": present,
            "absent": absent,
            "presentRate": present_rate(present, present + absent),
        },
    }))
}

const MAX_RANGE_DAYS: i64 = 366;

fn attendance_trend(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let to = match get_opt_str(params, "to")? {
        Some(d) => parse_date(d, "to")?,
        None => chrono::Local::now().date_naive(),
    };
    let from = match get_opt_str(params, "from")? {
        Some(d) => parse_date(d, "from")?,
        None => to - Duration::days(6),
    };
    if from > to {
        return Err(AppError::bad_params("from must not be after to"));
    }
    if (to - from).num_days() >= MAX_RANGE_DAYS {
        return Err(AppError::bad_params(format!(
            "range must be shorter than {} days",
            MAX_RANGE_DAYS
        )));
    }

    let mut sql = "SELECT at.date,
            SUM(CASE WHEN at.status = 'PRESENT' THEN 1 ELSE 0 END),
            SUM(CASE WHEN at.status = 'ABSENT' THEN 1 ELSE 0 END)
         FROM attendance at JOIN students s ON s.id = at.student_id
         WHERE at.date >= ? AND at.date <= ?"
        .to_string();
    let mut binds = vec![
        SqlValue::Text(from.format("%Y-%m-%d").to_string()),
        SqlValue::Text(to.format("%Y-%m-%d").to_string()),
    ];
    scope.push_clause("s.branch_id", &mut sql, &mut binds);
    if let Some(course_id) = get_opt_str(params, "courseId")? {
        sql.push_str(" AND at.course_id = ?");
        binds.push(SqlValue::Text(course_id.to_string()));
    }
    sql.push_str(" GROUP BY at.date");
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // One entry per calendar day, including days nobody was marked.
    let mut days = Vec::new();
    let mut d = from;
    while d <= to {
        let key = d.format("%Y-%m-%d").to_string();
        let (present, absent) = found
            .iter()
            .find(|(date, _, _)| *date == key)
            .map(|(_, p, a)| (*p, *a))
            .unwrap_or((0, 0));
        days.push(json!({
            "date": key,
            "present": present,
            "absent": absent,
            "presentRate": present_rate(present, present + absent),
        }));
        d += Duration::days(1);
    }
    Ok(json!({ "days": days }))
}

fn handle_dashboard_kpis(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, kpis)
}

fn handle_dashboard_attendance(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, attendance_trend)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "dashboard.kpis" => Some(handle_dashboard_kpis(state, req)),
        "dashboard.attendance" => Some(handle_dashboard_attendance(state, req)),
        _ => None,
    }
}
