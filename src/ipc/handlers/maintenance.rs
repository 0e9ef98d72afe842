use crate::auth::{self, Caller, Role};
use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::auth::verify_credentials;
use crate::ipc::handlers::branches::normalize_branch_code;
use crate::ipc::helpers::{get_opt_str, get_required_str, with_caller};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{self, normalize_email};
use crate::scope::BranchScope;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

fn profiles_check(conn: &Connection, caller: &Caller, _params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let report = profiles::check(conn, &scope)?;
    Ok(json!({
        "complete": report.is_complete(),
        "studentsMissing": report.students_missing,
        "trainersMissing": report.trainers_missing,
    }))
}

fn profiles_repair(conn: &Connection, caller: &Caller, _params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let report = profiles::repair(conn, &scope)?;
    info!(
        students = report.students_created.len(),
        trainers = report.trainers_created.len(),
        unrepairable = report.unrepairable.len(),
        "profile repair finished"
    );
    Ok(serde_json::to_value(report).map_err(anyhow::Error::from)?)
}

fn branch_consistency_check(conn: &Connection, caller: &Caller, _params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let found = profiles::branch_mismatches(conn, &scope)?;
    Ok(json!({ "consistent": found.is_empty(), "mismatches": found }))
}

fn branch_consistency_repair(conn: &Connection, caller: &Caller, _params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo])?;
    let fixed = profiles::repair_branch_mismatches(conn, &BranchScope::All)?;
    Ok(json!({ "repaired": fixed }))
}

fn credentials_verify(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo])?;
    let email = get_required_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;
    match verify_credentials(conn, email, password) {
        Ok(user) => Ok(json!({
            "valid": true,
            "userId": user.user_id,
            "role": user.role.as_str(),
        })),
        Err(AppError::Unauthorized(reason)) => Ok(json!({ "valid": false, "reason": reason })),
        Err(e) => Err(e),
    }
}

/// CEO may reset anyone. A branch head may reset trainers and students of their own branch.
fn credentials_reset(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo, Role::BranchHead])?;
    let scope = BranchScope::for_caller(caller)?;
    let password = params
        .get("newPassword")
        .or_else(|| params.get("password"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing newPassword"))?;
    auth::validate_password(password)?;

    let target: Option<(String, String, Option<String>)> = match get_opt_str(params, "userId")? {
        Some(id) => conn
            .query_row(
                "SELECT id, role, branch_id FROM users WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?,
        None => {
            let email = normalize_email(get_required_str(params, "email")?)?;
            conn.query_row(
                "SELECT id, role, branch_id FROM users WHERE email = ?",
                [&email],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?
        }
    };
    let visible = |branch: &Option<String>| match branch {
        Some(b) => scope.allows(b),
        None => scope == BranchScope::All,
    };
    let Some((user_id, role, _)) = target.filter(|(_, _, b)| visible(b)) else {
        return Err(AppError::NotFound("user"));
    };
    if !caller.is_ceo() && user_id != caller.user_id && (role == "CEO" || role == "BRANCH_HEAD") {
        return Err(AppError::forbidden("branch heads reset trainers and students only"));
    }

    conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (auth::hash_password(password)?, now_rfc3339(), &user_id),
    )?;
    info!(user_id = %user_id, by = %caller.user_id, "password reset");
    Ok(json!({ "userId": user_id, "reset": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SeedCourse {
    code: String,
    name: String,
    duration_weeks: Option<i64>,
    fee: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SeedBranch {
    code: String,
    name: String,
    #[serde(default)]
    courses: Vec<SeedCourse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedParams {
    branches: Vec<SeedBranch>,
}

/// Inserts fixture branches and courses that are not present yet, matched by code.
fn seed(conn: &Connection, caller: &Caller, params: &Value) -> AppResult<Value> {
    caller.require(&[Role::Ceo])?;
    let seed: SeedParams = serde_json::from_value(params.clone())
        .map_err(|e| AppError::bad_params(format!("invalid seed: {e}")))?;
    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    let (mut branches_created, mut courses_created) = (0usize, 0usize);
    for b in &seed.branches {
        let code = normalize_branch_code(&b.code)?;
        let existing: Option<String> = tx
            .query_row("SELECT id FROM branches WHERE code = ?", [&code], |r| r.get(0))
            .optional()?;
        let branch_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO branches(id, name, code, active, created_at) VALUES(?, ?, ?, 1, ?)",
                    (&id, b.name.trim(), &code, &now),
                )?;
                branches_created += 1;
                id
            }
        };
        for c in &b.courses {
            let course_code = c.code.trim().to_ascii_uppercase();
            if course_code.is_empty() {
                return Err(AppError::bad_params("course code must not be empty"));
            }
            courses_created += tx.execute(
                "INSERT INTO courses(id, branch_id, code, name, duration_weeks, fee, active, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, 1, ?)
                 ON CONFLICT(branch_id, code) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    &branch_id,
                    &course_code,
                    c.name.trim(),
                    c.duration_weeks,
                    c.fee,
                    &now,
                ),
            )?;
        }
    }
    tx.commit()?;
    info!(branches_created, courses_created, "seed applied");
    Ok(json!({
        "branchesCreated": branches_created,
        "coursesCreated": courses_created,
    }))
}

fn handle_profiles_check(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, profiles_check)
}

fn handle_profiles_repair(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, profiles_repair)
}

fn handle_branch_consistency_check(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, branch_consistency_check)
}

fn handle_branch_consistency_repair(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, branch_consistency_repair)
}

fn handle_credentials_verify(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, credentials_verify)
}

fn handle_credentials_reset(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, credentials_reset)
}

fn handle_seed(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, seed)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "maintenance.profiles.check" => Some(handle_profiles_check(state, req)),
        "maintenance.profiles.repair" => Some(handle_profiles_repair(state, req)),
        "maintenance.branchConsistency.check" => Some(handle_branch_consistency_check(state, req)),
        "maintenance.branchConsistency.repair" => {
            Some(handle_branch_consistency_repair(state, req))
        }
        "maintenance.credentials.verify" => Some(handle_credentials_verify(state, req)),
        "maintenance.credentials.reset" | "users.resetPassword" => {
            Some(handle_credentials_reset(state, req))
        }
        "maintenance.seed" => Some(handle_seed(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_params_reject_unknown_fields() {
        let ok: SeedParams = serde_json::from_value(json!({
            "branches": [{ "code": "slm", "name": "Salem", "courses": [{ "code": "py", "name": "Python" }] }]
        }))
        .expect("valid seed");
        assert_eq!(ok.branches[0].courses.len(), 1);
        assert!(serde_json::from_value::<SeedParams>(json!({
            "branches": [{ "code": "slm", "name": "Salem", "city": "x" }]
        }))
        .is_err());
    }
}
