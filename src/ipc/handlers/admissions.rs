use crate::auth::{Caller, Role};
use crate::db::{next_sequence_code, now_rfc3339};
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::courses::course_branch;
use crate::ipc::handlers::setup::admission_prefix;
use crate::ipc::helpers::{get_opt_f64, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{branch_code, normalize_email};
use crate::scope::BranchScope;
use chrono::Datelike;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    New,
    Approved,
    Rejected,
    Enrolled,
}

impl AdmissionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "ENROLLED" => Some(Self::Enrolled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Enrolled => "ENROLLED",
        }
    }

    /// Moves reachable through `admissions.setStatus`. ENROLLED is only set by enrollment.
    fn can_move_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Approved) | (Self::New, Self::Rejected) | (Self::Approved, Self::Rejected)
        )
    }
}

const ADMISSION_SELECT: &str = "SELECT
       a.id, a.admission_no, a.branch_id, a.course_id, a.lead_id, a.full_name, a.email,
       a.phone, a.qualification, a.total_fee, a.fee_paid, a.status, a.created_by,
       a.created_at, (SELECT s.id FROM students s WHERE s.admission_id = a.id)
     FROM admissions a
     WHERE 1 = 1";

fn admission_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "admissionNo": r.get::<_, String>(1)?,
        "branchId": r.get::<_, String>(2)?,
        "courseId": r.get::<_, String>(3)?,
        "leadId": r.get::<_, Option<String>>(4)?,
        "fullName": r.get::<_, String>(5)?,
        "email": r.get::<_, Option<String>>(6)?,
        "phone": r.get::<_, Option<String>>(7)?,
        "qualification": r.get::<_, Option<String>>(8)?,
        "totalFee": r.get::<_, f64>(9)?,
        "feePaid": r.get::<_, f64>(10)?,
        "status": r.get::<_, String>(11)?,
        "createdBy": r.get::<_, String>(12)?,
        "createdAt": r.get::<_, String>(13)?,
        "studentId": r.get::<_, Option<String>>(14)?,
    }))
}

pub fn get_admission(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND a.id = ?", ADMISSION_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("a.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), admission_json)
        .optional()?
        .ok_or(AppError::NotFound("admission"))
}

pub struct NewAdmission<'a> {
    pub branch_id: &'a str,
    pub course_id: &'a str,
    pub lead_id: Option<&'a str>,
    pub full_name: &'a str,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub qualification: Option<&'a str>,
    pub total_fee: f64,
    pub fee_paid: f64,
    pub created_by: &'a str,
}

fn check_fees(total: f64, paid: f64) -> AppResult<()> {
    if paid > total {
        return Err(AppError::bad_params("feePaid cannot exceed totalFee"));
    }
    Ok(())
}

/// Inserts a NEW admission numbered `<prefix>-<BRANCHCODE>-<YEAR>-NNNN`.
pub fn insert_admission(conn: &Connection, adm: &NewAdmission<'_>) -> AppResult<(String, String)> {
    check_fees(adm.total_fee, adm.fee_paid)?;
    let email = adm.email.map(normalize_email).transpose()?;
    let prefix = format!(
        "{}-{}-{}-",
        admission_prefix(conn)?,
        branch_code(conn, adm.branch_id)?,
        chrono::Utc::now().year()
    );
    let admission_no = next_sequence_code(conn, "admissions", "admission_no", &prefix)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO admissions(id, admission_no, branch_id, course_id, lead_id, full_name, email, phone,
                                qualification, total_fee, fee_paid, status, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'NEW', ?, ?)",
        (
            &id,
            &admission_no,
            adm.branch_id,
            adm.course_id,
            adm.lead_id,
            adm.full_name,
            &email,
            adm.phone,
            adm.qualification,
            adm.total_fee,
            adm.fee_paid,
            adm.created_by,
            now_rfc3339(),
        ),
    )?;
    Ok((id, admission_no))
}

fn list_admissions(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = ADMISSION_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("a.branch_id", &mut sql, &mut binds);
    if let Some(status) = get_opt_str(params, "status")? {
        let status = AdmissionStatus::parse(status)
            .ok_or_else(|| AppError::bad_params("unknown admission status"))?;
        sql.push_str(" AND a.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    for (key, column) in [("branchId", "a.branch_id"), ("courseId", "a.course_id")] {
        if let Some(v) = get_opt_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    sql.push_str(" ORDER BY a.created_at DESC, a.admission_no DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), admission_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "admissions": rows }))
}

fn admission_detail(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "admissionId")?;
    Ok(json!({ "admission": get_admission(conn, &scope, id)? }))
}

fn create(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let course_id = get_required_str(params, "courseId")?;
    let branch_id = course_branch(conn, &scope, course_id)?;
    if let Some(requested) = get_opt_str(params, "branchId")? {
        if requested != branch_id {
            return Err(AppError::bad_params("course belongs to another branch"));
        }
    }
    let (id, admission_no) = insert_admission(
        conn,
        &NewAdmission {
            branch_id: &branch_id,
            course_id,
            lead_id: None,
            full_name: get_required_str(params, "fullName")?,
            email: get_opt_str(params, "email")?,
            phone: get_opt_str(params, "phone")?,
            qualification: get_opt_str(params, "qualification")?,
            total_fee: get_opt_f64(params, "totalFee")?.unwrap_or(0.0),
            fee_paid: get_opt_f64(params, "feePaid")?.unwrap_or(0.0),
            created_by: &caller.user_id,
        },
    )?;
    info!(admission_no = %admission_no, branch_id = %branch_id, "admission created");
    Ok(json!({ "admission": get_admission(conn, &scope, &id)? }))
}

fn update(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "admissionId")?;
    let current = get_admission(conn, &scope, id)?;
    let total = get_opt_f64(params, "totalFee")?
        .unwrap_or_else(|| current["totalFee"].as_f64().unwrap_or(0.0));
    let paid = get_opt_f64(params, "feePaid")?
        .unwrap_or_else(|| current["feePaid"].as_f64().unwrap_or(0.0));
    check_fees(total, paid)?;

    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    tx.execute(
        "UPDATE admissions SET total_fee = ?, fee_paid = ?, updated_at = ? WHERE id = ?",
        (total, paid, &now, id),
    )?;
    for (key, column) in [
        ("fullName", "full_name"),
        ("phone", "phone"),
        ("qualification", "qualification"),
    ] {
        if let Some(v) = get_opt_str(params, key)? {
            tx.execute(
                &format!("UPDATE admissions SET {} = ? WHERE id = ?", column),
                (v, id),
            )?;
        }
    }
    if let Some(email) = get_opt_str(params, "email")? {
        tx.execute(
            "UPDATE admissions SET email = ? WHERE id = ?",
            (normalize_email(email)?, id),
        )?;
    }
    if let Some(course_id) = get_opt_str(params, "courseId")? {
        if current["status"] == "ENROLLED" {
            return Err(AppError::bad_params("cannot change the course of an enrolled admission"));
        }
        let branch_id = course_branch(&tx, &scope, course_id)?;
        if current["branchId"] != branch_id.as_str() {
            return Err(AppError::bad_params("course belongs to another branch"));
        }
        tx.execute(
            "UPDATE admissions SET course_id = ? WHERE id = ?",
            (course_id, id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "admission": get_admission(conn, &scope, id)? }))
}

fn set_status(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "admissionId")?;
    let next = AdmissionStatus::parse(get_required_str(params, "status")?)
        .ok_or_else(|| AppError::bad_params("unknown admission status"))?;
    let current = get_admission(conn, &scope, id)?;
    let from_raw = current["status"].as_str().unwrap_or_default();
    let from = AdmissionStatus::parse(from_raw)
        .ok_or_else(|| anyhow::anyhow!("stored admission status {from_raw:?} is invalid"))?;
    if from == next {
        return Ok(json!({ "admission": current }));
    }
    if !from.can_move_to(next) {
        return Err(AppError::InvalidTransition {
            entity: "admission",
            from: from.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    conn.execute(
        "UPDATE admissions SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), now_rfc3339(), id),
    )?;
    info!(admission_id = %id, from = from.as_str(), to = next.as_str(), "admission status changed");
    Ok(json!({ "admission": get_admission(conn, &scope, id)? }))
}

fn delete(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "admissionId")?;
    let current = get_admission(conn, &scope, id)?;
    if !current["studentId"].is_null() {
        return Err(AppError::HasDependents {
            entity: "admission",
            dependents: "student",
        });
    }
    // The store still refuses if a student slipped in between the check and the delete.
    match conn.execute("DELETE FROM admissions WHERE id = ?", [id]) {
        Ok(_) => {}
        Err(e) => {
            return Err(match AppError::from(e) {
                AppError::ForeignKeyViolation { .. } => AppError::HasDependents {
                    entity: "admission",
                    dependents: "student",
                },
                other => other,
            })
        }
    }
    info!(admission_id = %id, "admission deleted");
    Ok(json!({ "deleted": true, "admissionId": id }))
}

fn handle_admissions_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_admissions)
}

fn handle_admissions_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, admission_detail)
}

fn handle_admissions_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create)
}

fn handle_admissions_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update)
}

fn handle_admissions_set_status(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, set_status)
}

fn handle_admissions_delete(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, delete)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "admissions.list" => Some(handle_admissions_list(state, req)),
        "admissions.get" => Some(handle_admissions_get(state, req)),
        "admissions.create" => Some(handle_admissions_create(state, req)),
        "admissions.update" => Some(handle_admissions_update(state, req)),
        "admissions.setStatus" => Some(handle_admissions_set_status(state, req)),
        "admissions.delete" => Some(handle_admissions_delete(state, req)),
        _ => None,
    }
}
