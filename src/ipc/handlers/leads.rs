use crate::auth::{Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::admissions::{get_admission, insert_admission, NewAdmission};
use crate::ipc::handlers::courses::course_branch;
use crate::ipc::helpers::{get_opt_f64, get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::normalize_email;
use crate::scope::BranchScope;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadStatus {
    New,
    Contacted,
    Interested,
    Converted,
    Lost,
}

impl LeadStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "CONTACTED" => Some(Self::Contacted),
            "INTERESTED" => Some(Self::Interested),
            "CONVERTED" => Some(Self::Converted),
            "LOST" => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Contacted => "CONTACTED",
            Self::Interested => "INTERESTED",
            Self::Converted => "CONVERTED",
            Self::Lost => "LOST",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Converted | Self::Lost)
    }

    /// Moves reachable through `leads.setStatus`; conversion has its own method.
    fn can_move_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Contacted)
                | (Self::New, Self::Lost)
                | (Self::Contacted, Self::Interested)
                | (Self::Contacted, Self::Lost)
                | (Self::Interested, Self::Lost)
        )
    }
}

const LEAD_SOURCES: &[&str] = &["WALK_IN", "PHONE", "WEBSITE", "REFERRAL", "SOCIAL", "OTHER"];

fn parse_source(raw: &str) -> AppResult<String> {
    let s = raw.trim().to_ascii_uppercase().replace([' ', '-'], "_");
    if LEAD_SOURCES.contains(&s.as_str()) {
        Ok(s)
    } else {
        Err(AppError::bad_params(format!(
            "source must be one of {}",
            LEAD_SOURCES.join(", ")
        )))
    }
}

const LEAD_SELECT: &str = "SELECT
       l.id, l.branch_id, l.created_by, l.full_name, l.email, l.phone, l.source,
       l.course_id, l.status, l.notes, l.created_at, l.updated_at,
       (SELECT a.id FROM admissions a WHERE a.lead_id = l.id ORDER BY a.created_at DESC LIMIT 1)
     FROM leads l
     WHERE 1 = 1";

fn lead_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "branchId": r.get::<_, String>(1)?,
        "createdBy": r.get::<_, String>(2)?,
        "fullName": r.get::<_, String>(3)?,
        "email": r.get::<_, Option<String>>(4)?,
        "phone": r.get::<_, Option<String>>(5)?,
        "source": r.get::<_, String>(6)?,
        "courseId": r.get::<_, Option<String>>(7)?,
        "status": r.get::<_, String>(8)?,
        "notes": r.get::<_, Option<String>>(9)?,
        "createdAt": r.get::<_, String>(10)?,
        "updatedAt": r.get::<_, Option<String>>(11)?,
        "admissionId": r.get::<_, Option<String>>(12)?,
    }))
}

fn get_lead(conn: &Connection, scope: &BranchScope, id: &str) -> AppResult<Value> {
    let mut sql = format!("{} AND l.id = ?", LEAD_SELECT);
    let mut binds = vec![SqlValue::Text(id.to_string())];
    scope.push_clause("l.branch_id", &mut sql, &mut binds);
    conn.query_row(&sql, params_from_iter(binds), lead_json)
        .optional()?
        .ok_or(AppError::NotFound("lead"))
}

fn stored_status(lead: &Value) -> AppResult<LeadStatus> {
    let raw = lead["status"].as_str().unwrap_or_default();
    LeadStatus::parse(raw)
        .ok_or_else(|| anyhow::anyhow!("stored lead status {raw:?} is invalid").into())
}

fn list_leads(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let mut sql = LEAD_SELECT.to_string();
    let mut binds = Vec::new();
    scope.push_clause("l.branch_id", &mut sql, &mut binds);
    if let Some(status) = get_opt_str(params, "status")? {
        let status =
            LeadStatus::parse(status).ok_or_else(|| AppError::bad_params("unknown lead status"))?;
        sql.push_str(" AND l.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(source) = get_opt_str(params, "source")? {
        sql.push_str(" AND l.source = ?");
        binds.push(SqlValue::Text(parse_source(source)?));
    }
    if let Some(branch_id) = get_opt_str(params, "branchId")? {
        sql.push_str(" AND l.branch_id = ?");
        binds.push(SqlValue::Text(branch_id.to_string()));
    }
    sql.push_str(" ORDER BY l.created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), lead_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "leads": rows }))
}

fn lead_detail(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "leadId")?;
    Ok(json!({ "lead": get_lead(conn, &scope, id)? }))
}

fn create(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let branch_id = scope.write_branch(get_opt_str(params, "branchId")?)?;
    let full_name = get_required_str(params, "fullName")?;
    let email = get_opt_str(params, "email")?.map(normalize_email).transpose()?;
    let phone = get_opt_str(params, "phone")?;
    if email.is_none() && phone.is_none() {
        return Err(AppError::bad_params("a lead needs an email or a phone"));
    }
    let source = parse_source(get_opt_str(params, "source")?.unwrap_or("OTHER"))?;
    let course_id = get_opt_str(params, "courseId")?;
    if let Some(c) = course_id {
        if course_branch(conn, &scope, c)? != branch_id {
            return Err(AppError::bad_params("course belongs to another branch"));
        }
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO leads(id, branch_id, created_by, full_name, email, phone, source, course_id, status, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'NEW', ?, ?)",
        (
            &id,
            &branch_id,
            &caller.user_id,
            full_name,
            &email,
            phone,
            &source,
            course_id,
            get_opt_str(params, "notes")?,
            now_rfc3339(),
        ),
    )?;
    Ok(json!({ "lead": get_lead(conn, &scope, &id)? }))
}

fn update(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "leadId")?;
    let current = get_lead(conn, &scope, id)?;
    if stored_status(&current)?.is_terminal() {
        return Err(AppError::bad_params("closed leads cannot be edited"));
    }
    let branch_id = current["branchId"].as_str().unwrap_or_default().to_string();

    let tx = conn.unchecked_transaction()?;
    for (key, column) in [("fullName", "full_name"), ("phone", "phone"), ("notes", "notes")] {
        if let Some(v) = get_opt_str(params, key)? {
            tx.execute(&format!("UPDATE leads SET {} = ? WHERE id = ?", column), (v, id))?;
        }
    }
    if let Some(email) = get_opt_str(params, "email")? {
        tx.execute(
            "UPDATE leads SET email = ? WHERE id = ?",
            (normalize_email(email)?, id),
        )?;
    }
    if let Some(source) = get_opt_str(params, "source")? {
        tx.execute(
            "UPDATE leads SET source = ? WHERE id = ?",
            (parse_source(source)?, id),
        )?;
    }
    if let Some(course_id) = get_opt_str(params, "courseId")? {
        if course_branch(&tx, &scope, course_id)? != branch_id {
            return Err(AppError::bad_params("course belongs to another branch"));
        }
        tx.execute("UPDATE leads SET course_id = ? WHERE id = ?", (course_id, id))?;
    }
    tx.execute(
        "UPDATE leads SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), id),
    )?;
    tx.commit()?;
    Ok(json!({ "lead": get_lead(conn, &scope, id)? }))
}

fn set_status(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "leadId")?;
    let next = LeadStatus::parse(get_required_str(params, "status")?)
        .ok_or_else(|| AppError::bad_params("unknown lead status"))?;
    let current = get_lead(conn, &scope, id)?;
    let from = stored_status(&current)?;
    if from == next {
        return Ok(json!({ "lead": current }));
    }
    if !from.can_move_to(next) {
        return Err(AppError::InvalidTransition {
            entity: "lead",
            from: from.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    conn.execute(
        "UPDATE leads SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), now_rfc3339(), id),
    )?;
    Ok(json!({ "lead": get_lead(conn, &scope, id)? }))
}

fn convert(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let id = get_required_str(params, "leadId")?;
    let lead = get_lead(conn, &scope, id)?;
    let from = stored_status(&lead)?;
    if from.is_terminal() {
        return Err(AppError::InvalidTransition {
            entity: "lead",
            from: from.as_str().to_string(),
            to: LeadStatus::Converted.as_str().to_string(),
        });
    }
    let branch_id = lead["branchId"].as_str().unwrap_or_default().to_string();
    let course_id = get_opt_str(params, "courseId")?
        .or_else(|| lead["courseId"].as_str())
        .ok_or_else(|| AppError::bad_params("missing courseId"))?
        .to_string();
    if course_branch(conn, &scope, &course_id)? != branch_id {
        return Err(AppError::bad_params("course belongs to another branch"));
    }

    let tx = conn.unchecked_transaction()?;
    let (admission_id, admission_no) = insert_admission(
        &tx,
        &NewAdmission {
            branch_id: &branch_id,
            course_id: &course_id,
            lead_id: Some(id),
            full_name: lead["fullName"].as_str().unwrap_or_default(),
            email: lead["email"].as_str(),
            phone: lead["phone"].as_str(),
            qualification: get_opt_str(params, "qualification")?,
            total_fee: get_opt_f64(params, "totalFee")?.unwrap_or(0.0),
            fee_paid: get_opt_f64(params, "feePaid")?.unwrap_or(0.0),
            created_by: &caller.user_id,
        },
    )?;
    tx.execute(
        "UPDATE leads SET status = 'CONVERTED', course_id = ?, updated_at = ? WHERE id = ?",
        (&course_id, now_rfc3339(), id),
    )?;
    tx.commit()?;
    info!(lead_id = %id, admission_no = %admission_no, "lead converted");
    Ok(json!({
        "lead": get_lead(conn, &scope, id)?,
        "admission": get_admission(conn, &scope, &admission_id)?,
    }))
}

fn handle_leads_list(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, list_leads)
}

fn handle_leads_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, lead_detail)
}

fn handle_leads_create(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, create)
}

fn handle_leads_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, update)
}

fn handle_leads_set_status(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, set_status)
}

fn handle_leads_convert(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, convert)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "leads.list" => Some(handle_leads_list(state, req)),
        "leads.get" => Some(handle_leads_get(state, req)),
        "leads.create" => Some(handle_leads_create(state, req)),
        "leads.update" => Some(handle_leads_update(state, req)),
        "leads.setStatus" => Some(handle_leads_set_status(state, req)),
        "leads.convert" => Some(handle_leads_convert(state, req)),
        _ => None,
    }
}
