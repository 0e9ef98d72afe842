//! Users in the STUDENT and TRAINER roles each own exactly one profile row.
//!
//! New accounts get their profile in the same transaction as the user row. The check and
//! repair routines cover stores written before that was enforced.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::db::{self, now_rfc3339};
use crate::error::{AppError, AppResult};
use crate::scope::BranchScope;

pub struct NewUser<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
    pub role: Role,
    pub branch_id: Option<&'a str>,
}

pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AppError::bad_params("email must contain @"));
    };
    if local.is_empty() || domain.is_empty() || email.len() > 254 {
        return Err(AppError::bad_params("email is malformed"));
    }
    Ok(email)
}

/// Inserts the bare user row. Callers creating STUDENT or TRAINER accounts must add the
/// profile inside the same transaction.
pub fn insert_user(conn: &Connection, user: &NewUser<'_>) -> AppResult<String> {
    let email = normalize_email(user.email)?;
    auth::validate_password(user.password)?;
    let full_name = user.full_name.trim();
    if full_name.is_empty() {
        return Err(AppError::bad_params("fullName must not be empty"));
    }
    match (user.role, user.branch_id) {
        (Role::Ceo, Some(_)) => {
            return Err(AppError::bad_params("CEO accounts are not tied to a branch"))
        }
        (Role::Ceo, None) => {}
        (_, None) => return Err(AppError::bad_params("branchId is required for this role")),
        (_, Some(_)) => {}
    }

    let id = Uuid::new_v4().to_string();
    let hash = auth::hash_password(user.password)?;
    conn.execute(
        "INSERT INTO users(id, email, password_hash, full_name, role, branch_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &email,
            &hash,
            full_name,
            user.role.as_str(),
            user.branch_id,
            now_rfc3339(),
        ),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledStudent {
    pub student_id: String,
    pub user_id: String,
    pub admission_id: String,
    pub branch_id: String,
    pub course_id: String,
}

pub struct EnrollStudent<'a> {
    pub admission_id: &'a str,
    pub email: Option<&'a str>,
    pub password: &'a str,
    pub batch_id: Option<&'a str>,
}

struct AdmissionRow {
    branch_id: String,
    course_id: String,
    full_name: String,
    email: Option<String>,
    status: String,
}

fn load_admission(conn: &Connection, id: &str) -> AppResult<Option<AdmissionRow>> {
    Ok(conn
        .query_row(
            "SELECT branch_id, course_id, full_name, email, status FROM admissions WHERE id = ?",
            [id],
            |r| {
                Ok(AdmissionRow {
                    branch_id: r.get(0)?,
                    course_id: r.get(1)?,
                    full_name: r.get(2)?,
                    email: r.get(3)?,
                    status: r.get(4)?,
                })
            },
        )
        .optional()?)
}

pub fn check_batch_fits(
    conn: &Connection,
    batch_id: &str,
    branch_id: &str,
    course_id: &str,
) -> AppResult<()> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT branch_id, course_id FROM batches WHERE id = ?",
            [batch_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((b_branch, b_course)) = row else {
        return Err(AppError::NotFound("batch"));
    };
    if b_branch != branch_id || b_course != course_id {
        return Err(AppError::bad_params(
            "batch must belong to the student's branch and course",
        ));
    }
    Ok(())
}

/// Creates the STUDENT user and its profile from an approved admission, atomically.
pub fn enroll_student(
    conn: &Connection,
    scope: &BranchScope,
    req: &EnrollStudent<'_>,
) -> AppResult<EnrolledStudent> {
    let tx = conn.unchecked_transaction()?;
    let Some(adm) = load_admission(&tx, req.admission_id)? else {
        return Err(AppError::NotFound("admission"));
    };
    if !scope.allows(&adm.branch_id) {
        return Err(AppError::NotFound("admission"));
    }
    if adm.status != "APPROVED" {
        return Err(AppError::InvalidTransition {
            entity: "admission",
            from: adm.status,
            to: "ENROLLED".to_string(),
        });
    }
    if let Some(batch_id) = req.batch_id {
        check_batch_fits(&tx, batch_id, &adm.branch_id, &adm.course_id)?;
    }
    let email = req
        .email
        .map(str::to_string)
        .or(adm.email.clone())
        .ok_or_else(|| AppError::bad_params("missing email (admission has none)"))?;

    let user_id = insert_user(
        &tx,
        &NewUser {
            email: &email,
            password: req.password,
            full_name: &adm.full_name,
            role: Role::Student,
            branch_id: Some(&adm.branch_id),
        },
    )?;
    let student_id = Uuid::new_v4().to_string();
    let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
    tx.execute(
        "INSERT INTO students(id, user_id, admission_id, branch_id, course_id, batch_id, enrolled_on, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &student_id,
            &user_id,
            req.admission_id,
            &adm.branch_id,
            &adm.course_id,
            req.batch_id,
            &today,
        ),
    )?;
    tx.execute(
        "UPDATE admissions SET status = 'ENROLLED', updated_at = ? WHERE id = ?",
        (now_rfc3339(), req.admission_id),
    )?;
    tx.commit()?;
    info!(student_id = %student_id, admission_id = %req.admission_id, "enrolled student");

    Ok(EnrolledStudent {
        student_id,
        user_id,
        admission_id: req.admission_id.to_string(),
        branch_id: adm.branch_id,
        course_id: adm.course_id,
    })
}

pub struct NewTrainer<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
    pub branch_id: &'a str,
    pub employee_id: Option<&'a str>,
    pub specialization: Option<&'a str>,
    pub joined_on: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTrainer {
    pub trainer_id: String,
    pub user_id: String,
    pub employee_id: String,
}

pub fn branch_code(conn: &Connection, branch_id: &str) -> AppResult<String> {
    conn.query_row("SELECT code FROM branches WHERE id = ?", [branch_id], |r| {
        r.get(0)
    })
    .optional()?
    .ok_or(AppError::NotFound("branch"))
}

fn insert_trainer_profile(
    conn: &Connection,
    user_id: &str,
    branch_id: &str,
    employee_id: Option<&str>,
    specialization: Option<&str>,
    joined_on: Option<&str>,
) -> AppResult<(String, String)> {
    let employee_id = match employee_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(e) => e.to_string(),
        None => {
            let code = branch_code(conn, branch_id)?;
            db::next_sequence_code(conn, "trainers", "employee_id", &format!("EMP-{}-", code))?
        }
    };
    let joined_on = joined_on
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string());
    let trainer_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO trainers(id, user_id, branch_id, employee_id, specialization, joined_on, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &trainer_id,
            user_id,
            branch_id,
            &employee_id,
            specialization,
            &joined_on,
            now_rfc3339(),
        ),
    )?;
    Ok((trainer_id, employee_id))
}

/// Creates the TRAINER user and its profile atomically.
pub fn create_trainer(conn: &Connection, req: &NewTrainer<'_>) -> AppResult<CreatedTrainer> {
    if let Some(d) = req.joined_on {
        crate::attendance::parse_date(d, "joinedOn")?;
    }
    let tx = conn.unchecked_transaction()?;
    branch_code(&tx, req.branch_id)?;
    let user_id = insert_user(
        &tx,
        &NewUser {
            email: req.email,
            password: req.password,
            full_name: req.full_name,
            role: Role::Trainer,
            branch_id: Some(req.branch_id),
        },
    )?;
    let (trainer_id, employee_id) = insert_trainer_profile(
        &tx,
        &user_id,
        req.branch_id,
        req.employee_id,
        req.specialization,
        req.joined_on,
    )?;
    tx.commit()?;
    Ok(CreatedTrainer {
        trainer_id,
        user_id,
        employee_id,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
    pub email: String,
    pub branch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub students_missing: Vec<UserRef>,
    pub trainers_missing: Vec<UserRef>,
}

impl ProfileReport {
    pub fn is_complete(&self) -> bool {
        self.students_missing.is_empty() && self.trainers_missing.is_empty()
    }
}

fn users_missing_profile(
    conn: &Connection,
    role: Role,
    profile_table: &str,
    scope: &BranchScope,
) -> AppResult<Vec<UserRef>> {
    let mut sql = format!(
        "SELECT u.id, u.email, u.branch_id FROM users u
         WHERE u.role = ? AND NOT EXISTS (SELECT 1 FROM {} p WHERE p.user_id = u.id)",
        profile_table
    );
    let mut binds = vec![rusqlite::types::Value::Text(role.as_str().to_string())];
    scope.push_clause("u.branch_id", &mut sql, &mut binds);
    sql.push_str(" ORDER BY u.email");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(UserRef {
                user_id: r.get(0)?,
                email: r.get(1)?,
                branch_id: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn check(conn: &Connection, scope: &BranchScope) -> AppResult<ProfileReport> {
    Ok(ProfileReport {
        students_missing: users_missing_profile(conn, Role::Student, "students", scope)?,
        trainers_missing: users_missing_profile(conn, Role::Trainer, "trainers", scope)?,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unrepairable {
    pub user_id: String,
    pub email: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub students_created: Vec<EnrolledStudent>,
    pub trainers_created: Vec<CreatedTrainer>,
    pub unrepairable: Vec<Unrepairable>,
}

// Prefer an admission in the user's own branch, then the furthest-along status, then newest.
fn best_admission_for(
    conn: &Connection,
    user: &UserRef,
) -> AppResult<Option<(String, AdmissionRow)>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT a.id FROM admissions a
             WHERE lower(trim(a.email)) = ?1
               AND a.status IN ('ENROLLED', 'APPROVED', 'NEW')
               AND NOT EXISTS (SELECT 1 FROM students s WHERE s.admission_id = a.id)
             ORDER BY
               CASE WHEN a.branch_id = ?2 THEN 0 ELSE 1 END,
               CASE a.status WHEN 'ENROLLED' THEN 0 WHEN 'APPROVED' THEN 1 ELSE 2 END,
               a.created_at DESC
             LIMIT 1",
            (&user.email, &user.branch_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(id) = id else { return Ok(None) };
    Ok(load_admission(conn, &id)?.map(|row| (id, row)))
}

/// Synthesizes missing profiles. Running it again after a successful pass changes nothing.
pub fn repair(conn: &Connection, scope: &BranchScope) -> AppResult<RepairReport> {
    let report = check(conn, scope)?;
    let mut out = RepairReport::default();
    let tx = conn.unchecked_transaction()?;

    for user in &report.students_missing {
        let Some((admission_id, adm)) = best_admission_for(&tx, user)? else {
            warn!(user_id = %user.user_id, "no admission available to rebuild student profile");
            out.unrepairable.push(Unrepairable {
                user_id: user.user_id.clone(),
                email: user.email.clone(),
                reason: "no_matching_admission",
            });
            continue;
        };
        if !scope.allows(&adm.branch_id) {
            out.unrepairable.push(Unrepairable {
                user_id: user.user_id.clone(),
                email: user.email.clone(),
                reason: "admission_outside_scope",
            });
            continue;
        }
        let student_id = Uuid::new_v4().to_string();
        let enrolled_on = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        tx.execute(
            "INSERT INTO students(id, user_id, admission_id, branch_id, course_id, batch_id, enrolled_on, active)
             VALUES(?, ?, ?, ?, ?, NULL, ?, 1)",
            (
                &student_id,
                &user.user_id,
                &admission_id,
                &adm.branch_id,
                &adm.course_id,
                &enrolled_on,
            ),
        )?;
        // The admission decides the branch; keep the user row in line with it.
        tx.execute(
            "UPDATE users SET branch_id = ?, updated_at = ? WHERE id = ?",
            (&adm.branch_id, now_rfc3339(), &user.user_id),
        )?;
        tx.execute(
            "UPDATE admissions SET status = 'ENROLLED', updated_at = ? WHERE id = ?",
            (now_rfc3339(), &admission_id),
        )?;
        info!(user_id = %user.user_id, admission_id = %admission_id, "rebuilt student profile");
        out.students_created.push(EnrolledStudent {
            student_id,
            user_id: user.user_id.clone(),
            admission_id,
            branch_id: adm.branch_id,
            course_id: adm.course_id,
        });
    }

    for user in &report.trainers_missing {
        let Some(branch_id) = user.branch_id.as_deref() else {
            out.unrepairable.push(Unrepairable {
                user_id: user.user_id.clone(),
                email: user.email.clone(),
                reason: "user_has_no_branch",
            });
            continue;
        };
        let (trainer_id, employee_id) =
            insert_trainer_profile(&tx, &user.user_id, branch_id, None, None, None)?;
        info!(user_id = %user.user_id, employee_id = %employee_id, "rebuilt trainer profile");
        out.trainers_created.push(CreatedTrainer {
            trainer_id,
            user_id: user.user_id.clone(),
            employee_id,
        });
    }

    tx.commit()?;
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMismatch {
    pub student_id: String,
    pub user_id: String,
    pub admission_id: String,
    pub student_branch_id: String,
    pub user_branch_id: Option<String>,
    pub admission_branch_id: String,
}

pub fn branch_mismatches(conn: &Connection, scope: &BranchScope) -> AppResult<Vec<BranchMismatch>> {
    let mut sql = String::from(
        "SELECT s.id, s.user_id, s.admission_id, s.branch_id, u.branch_id, a.branch_id
         FROM students s
         JOIN users u ON u.id = s.user_id
         JOIN admissions a ON a.id = s.admission_id
         WHERE (s.branch_id <> a.branch_id OR u.branch_id IS NULL OR u.branch_id <> s.branch_id)",
    );
    let mut binds = Vec::new();
    if let BranchScope::Branch(id) = scope {
        sql.push_str(" AND (s.branch_id = ? OR a.branch_id = ? OR u.branch_id = ?)");
        for _ in 0..3 {
            binds.push(rusqlite::types::Value::Text(id.clone()));
        }
    }
    sql.push_str(" ORDER BY s.id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(BranchMismatch {
                student_id: r.get(0)?,
                user_id: r.get(1)?,
                admission_id: r.get(2)?,
                student_branch_id: r.get(3)?,
                user_branch_id: r.get(4)?,
                admission_branch_id: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Moves student and user rows onto their admission's branch.
pub fn repair_branch_mismatches(
    conn: &Connection,
    scope: &BranchScope,
) -> AppResult<Vec<BranchMismatch>> {
    let found = branch_mismatches(conn, scope)?;
    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    for m in &found {
        tx.execute(
            "UPDATE students SET branch_id = ?, updated_at = ? WHERE id = ?",
            (&m.admission_branch_id, &now, &m.student_id),
        )?;
        tx.execute(
            "UPDATE users SET branch_id = ?, updated_at = ? WHERE id = ?",
            (&m.admission_branch_id, &now, &m.user_id),
        )?;
    }
    tx.commit()?;
    if !found.is_empty() {
        info!(count = found.len(), "realigned student branches to admissions");
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO branches(id, name, code, created_at) VALUES
               ('b1', 'Salem', 'SLM', 'x'), ('b2', 'Erode', 'ERD', 'x');
             INSERT INTO users(id, email, password_hash, full_name, role, branch_id, created_at) VALUES
               ('head', 'head@x.test', 'h', 'Head', 'BRANCH_HEAD', 'b1', 'x');
             INSERT INTO courses(id, branch_id, code, name, created_at) VALUES
               ('c1', 'b1', 'PY', 'Python', 'x'), ('c2', 'b2', 'JV', 'Java', 'x');",
        )
        .expect("seed");
        conn
    }

    fn admission(conn: &Connection, id: &str, branch: &str, course: &str, email: &str, status: &str, at: &str) {
        conn.execute(
            "INSERT INTO admissions(id, admission_no, branch_id, course_id, full_name, email, status, created_by, created_at)
             VALUES(?, ?, ?, ?, 'Kid', ?, ?, 'head', ?)",
            (id, format!("ADM-{id}"), branch, course, email, status, at),
        )
        .expect("admission");
    }

    fn orphan_user(conn: &Connection, id: &str, email: &str, role: &str, branch: Option<&str>) {
        conn.execute(
            "INSERT INTO users(id, email, password_hash, full_name, role, branch_id, created_at)
             VALUES(?, ?, 'h', 'Orphan', ?, ?, 'x')",
            (id, email, role, branch),
        )
        .expect("user");
    }

    #[test]
    fn enroll_creates_user_and_profile_together() {
        let conn = store();
        admission(&conn, "a1", "b1", "c1", "kid@x.test", "APPROVED", "2024-01-01");
        let out = enroll_student(
            &conn,
            &BranchScope::Branch("b1".to_string()),
            &EnrollStudent {
                admission_id: "a1",
                email: None,
                password: "password123",
                batch_id: None,
            },
        )
        .expect("enroll");
        assert_eq!(out.branch_id, "b1");
        let (role, branch): (String, String) = conn
            .query_row(
                "SELECT role, branch_id FROM users WHERE id = ?",
                [&out.user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("user");
        assert_eq!((role.as_str(), branch.as_str()), ("STUDENT", "b1"));
        assert!(check(&conn, &BranchScope::All).expect("check").is_complete());
    }

    #[test]
    fn failed_enroll_leaves_no_orphan_user() {
        let conn = store();
        admission(&conn, "a1", "b1", "c1", "kid@x.test", "APPROVED", "2024-01-01");
        let err = enroll_student(
            &conn,
            &BranchScope::All,
            &EnrollStudent {
                admission_id: "a1",
                email: None,
                password: "password123",
                batch_id: Some("missing-batch"),
            },
        )
        .expect_err("bad batch");
        assert_eq!(err.code(), "not_found");
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE role = 'STUDENT'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(users, 0);
    }

    #[test]
    fn enroll_requires_approved_admission() {
        let conn = store();
        admission(&conn, "a1", "b1", "c1", "kid@x.test", "NEW", "2024-01-01");
        let err = enroll_student(
            &conn,
            &BranchScope::All,
            &EnrollStudent {
                admission_id: "a1",
                email: None,
                password: "password123",
                batch_id: None,
            },
        )
        .expect_err("new admission");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn repair_prefers_same_branch_then_status_and_is_idempotent() {
        let conn = store();
        orphan_user(&conn, "u1", "kid@x.test", "STUDENT", Some("b1"));
        orphan_user(&conn, "u2", "lost@x.test", "STUDENT", Some("b1"));
        orphan_user(&conn, "t1", "coach@x.test", "TRAINER", Some("b1"));
        admission(&conn, "other", "b2", "c2", "kid@x.test", "ENROLLED", "2024-05-01");
        admission(&conn, "new", "b1", "c1", "KID@x.test", "NEW", "2024-04-01");
        admission(&conn, "approved", "b1", "c1", "kid@x.test", "APPROVED", "2024-02-01");

        let before = check(&conn, &BranchScope::All).expect("check");
        assert_eq!(before.students_missing.len(), 2);
        assert_eq!(before.trainers_missing.len(), 1);

        let first = repair(&conn, &BranchScope::All).expect("repair");
        assert_eq!(first.students_created.len(), 1);
        assert_eq!(first.students_created[0].admission_id, "approved");
        assert_eq!(first.trainers_created.len(), 1);
        assert_eq!(first.trainers_created[0].employee_id, "EMP-SLM-0001");
        assert_eq!(first.unrepairable.len(), 1);
        assert_eq!(first.unrepairable[0].user_id, "u2");

        let second = repair(&conn, &BranchScope::All).expect("repair again");
        assert!(second.students_created.is_empty());
        assert!(second.trainers_created.is_empty());

        let after = check(&conn, &BranchScope::All).expect("check");
        assert_eq!(after.students_missing.len(), 1);
        assert_eq!(after.students_missing[0].user_id, "u2");
        assert!(after.trainers_missing.is_empty());
    }

    #[test]
    fn repair_reaches_zero_missing_when_admissions_exist() {
        let conn = store();
        orphan_user(&conn, "u1", "one@x.test", "STUDENT", None);
        orphan_user(&conn, "u2", "two@x.test", "STUDENT", Some("b2"));
        admission(&conn, "a1", "b1", "c1", "one@x.test", "APPROVED", "2024-01-01");
        admission(&conn, "a2", "b1", "c1", "two@x.test", "NEW", "2024-01-01");

        repair(&conn, &BranchScope::All).expect("first");
        repair(&conn, &BranchScope::All).expect("second");
        assert!(check(&conn, &BranchScope::All)
            .expect("check")
            .students_missing
            .is_empty());
        assert!(branch_mismatches(&conn, &BranchScope::All)
            .expect("mismatches")
            .is_empty());
    }

    #[test]
    fn branch_mismatch_is_realigned_to_admission() {
        let conn = store();
        admission(&conn, "a1", "b1", "c1", "kid@x.test", "ENROLLED", "2024-01-01");
        orphan_user(&conn, "u1", "kid@x.test", "STUDENT", Some("b2"));
        conn.execute(
            "INSERT INTO students(id, user_id, admission_id, branch_id, course_id, enrolled_on)
             VALUES('s1', 'u1', 'a1', 'b2', 'c1', '2024-01-01')",
            [],
        )
        .expect("student");

        let found = branch_mismatches(&conn, &BranchScope::Branch("b1".to_string()))
            .expect("scan");
        assert_eq!(found.len(), 1);
        repair_branch_mismatches(&conn, &BranchScope::All).expect("repair");
        assert!(branch_mismatches(&conn, &BranchScope::All)
            .expect("rescan")
            .is_empty());
    }

    #[test]
    fn user_rules() {
        let conn = store();
        let err = insert_user(
            &conn,
            &NewUser {
                email: "ceo@x.test",
                password: "password123",
                full_name: "Boss",
                role: Role::Ceo,
                branch_id: Some("b1"),
            },
        )
        .expect_err("ceo with branch");
        assert_eq!(err.code(), "bad_params");
        let err = insert_user(
            &conn,
            &NewUser {
                email: "HEAD@x.test",
                password: "password123",
                full_name: "Dup",
                role: Role::BranchHead,
                branch_id: Some("b1"),
            },
        )
        .expect_err("duplicate email");
        assert_eq!(err.code(), "unique_violation");
    }
}
