use crate::attendance::parse_date;
use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::students::push_student_visibility;
use crate::ipc::handlers::trainers::trainer_id_for_user;
use crate::ipc::helpers::{get_opt_i64, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn create_growth(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Trainer])?;
    let scope = BranchScope::for_caller(caller)?;
    let trainer_id = trainer_id_for_user(conn, &caller.user_id)?
        .ok_or_else(|| AppError::forbidden("no active trainer profile for this account"))?;
    let student_id = get_required_str(params, "studentId")?;
    let branch_id: Option<String> = conn
        .query_row(
            "SELECT branch_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(branch_id) = branch_id.filter(|b| scope.allows(b)) else {
        return Err(AppError::NotFound("student"));
    };
    let rating = get_opt_i64(params, "rating")?
        .ok_or_else(|| AppError::bad_params("missing rating"))?;
    if !(1..=5).contains(&rating) {
        return Err(AppError::bad_params("rating must be in 1..=5"));
    }
    let id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    conn.execute(
        "INSERT INTO student_growth_reports(id, student_id, trainer_id, branch_id, period_label, rating,
                                            strengths, improvements, remarks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            student_id,
            &trainer_id,
            &branch_id,
            get_required_str(params, "periodLabel")?,
            rating,
            get_opt_str(params, "strengths")?,
            get_opt_str(params, "improvements")?,
            get_opt_str(params, "remarks")?,
            &created_at,
        ),
    )?;
    Ok(json!({
        "report": {
            "id": id,
            "studentId": student_id,
            "trainerId": trainer_id,
            "branchId": branch_id,
            "rating": rating,
            "createdAt": created_at,
        }
    }))
}

fn list_growth(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = "SELECT g.id, g.student_id, g.trainer_id, g.branch_id, g.period_label, g.rating,
                g.strengths, g.improvements, g.remarks, g.created_at, su.full_name, tu.full_name
         FROM student_growth_reports g
         JOIN students s ON s.id = g.student_id
         JOIN users su ON su.id = s.user_id
         JOIN trainers t ON t.id = g.trainer_id
         JOIN users tu ON tu.id = t.user_id
         WHERE 1 = 1"
        .to_string();
    let mut binds = Vec::new();
    push_student_visibility(caller, &scope, "s", &mut sql, &mut binds);
    for (key, column) in [("studentId", "g.student_id"), ("trainerId", "g.trainer_id")] {
        if let Some(v) = get_opt_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    sql.push_str(" ORDER BY g.created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "trainerId": r.get::<_, String>(2)?,
                "branchId": r.get::<_, String>(3)?,
                "periodLabel": r.get::<_, String>(4)?,
                "rating": r.get::<_, i64>(5)?,
                "strengths": r.get::<_, Option<String>>(6)?,
                "improvements": r.get::<_, Option<String>>(7)?,
                "remarks": r.get::<_, Option<String>>(8)?,
                "createdAt": r.get::<_, String>(9)?,
                "studentName": r.get::<_, String>(10)?,
                "trainerName": r.get::<_, String>(11)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "reports": rows }))
}

fn create_branch_report(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::BranchHead, Role::Trainer])?;
    let scope = BranchScope::for_caller(caller)?;
    let branch_id = scope.write_branch(get_opt_str(params, "branchId")?)?;
    let report_date = match get_opt_str(params, "reportDate")? {
        Some(d) => parse_date(d, "reportDate")?,
        None => chrono::Local::now().date_naive(),
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO branch_reports(id, branch_id, author_user_id, report_date, title, summary, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &branch_id,
            &caller.user_id,
            report_date.format("%Y-%m-%d").to_string(),
            get_required_str(params, "title")?,
            get_required_str(params, "summary")?,
            now_rfc3339(),
        ),
    )?;
    Ok(json!({
        "report": {
            "id": id,
            "branchId": branch_id,
            "authorUserId": caller.user_id,
            "reportDate": report_date.format("%Y-%m-%d").to_string(),
        }
    }))
}

fn list_branch_reports(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead, Role::Trainer])?;
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = "SELECT r.id, r.branch_id, r.author_user_id, u.full_name, r.report_date, r.title,
                r.summary, r.created_at
         FROM branch_reports r
         JOIN users u ON u.id = r.author_user_id
         WHERE 1 = 1"
        .to_string();
    let mut binds = Vec::new();
    scope.push_clause("r.branch_id", &mut sql, &mut binds);
    if let Some(branch_id) = get_opt_str(params, "branchId")? {
        sql.push_str(" AND r.branch_id = ?");
        binds.push(SqlValue::Text(branch_id.to_string()));
    }
    if let Some(from) = get_opt_str(params, "from")? {
        sql.push_str(" AND r.report_date >= ?");
        binds.push(SqlValue::Text(parse_date(from, "from")?.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = get_opt_str(params, "to")? {
        sql.push_str(" AND r.report_date <= ?");
        binds.push(SqlValue::Text(parse_date(to, "to")?.format("%Y-%m-%d").to_string()));
    }
    sql.push_str(" ORDER BY r.report_date DESC, r.created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "branchId": r.get::<_, String>(1)?,
                "authorUserId": r.get::<_, String>(2)?,
                "authorName": r.get::<_, String>(3)?,
                "reportDate": r.get::<_, String>(4)?,
                "title": r.get::<_, String>(5)?,
                "summary": r.get::<_, String>(6)?,
                "createdAt": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "reports": rows }))
}

fn handle_growth_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create_growth)
}

fn handle_growth_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_growth)
}

fn handle_branch_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create_branch_report)
}

fn handle_branch_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_branch_reports)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.growth.create" => Some(handle_growth_create(state, req)),
        "reports.growth.list" => Some(handle_growth_list(state, req)),
        "reports.branch.create" => Some(handle_branch_create(state, req)),
        "reports.branch.list" => Some(handle_branch_list(state, req)),
        _ => None,
    }
}
