use crate::auth::Role;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_required_str, with_caller, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{insert_user, NewUser};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    Admissions,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "admissions" => Some(Self::Admissions),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::Admissions => "setup.admissions",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "periodsPerDay": 8,
            "allowFutureDates": false
        }),
        SetupSection::Admissions => json!({
            "numberPrefix": "ADM"
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "periodsPerDay" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
                }
                "allowFutureDates" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Admissions => match k.as_str() {
                "numberPrefix" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be string", k))?
                        .trim()
                        .to_ascii_uppercase();
                    if s.is_empty() || s.len() > 8 || !s.chars().all(|c| c.is_ascii_alphanumeric())
                    {
                        return Err("numberPrefix must be 1-8 letters or digits".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown admissions field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> AppResult<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct AttendancePolicy {
    pub periods_per_day: i64,
    pub allow_future_dates: bool,
}

pub fn attendance_policy(conn: &Connection) -> AppResult<AttendancePolicy> {
    let v = load_section(conn, SetupSection::Attendance)?;
    Ok(AttendancePolicy {
        periods_per_day: v.get("periodsPerDay").and_then(|v| v.as_i64()).unwrap_or(8),
        allow_future_dates: v
            .get("allowFutureDates")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

pub fn admission_prefix(conn: &Connection) -> AppResult<String> {
    let v = load_section(conn, SetupSection::Admissions)?;
    Ok(v.get("numberPrefix")
        .and_then(|v| v.as_str())
        .unwrap_or("ADM")
        .to_string())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |conn, _, _| {
        Ok(json!({
            "attendance": load_section(conn, SetupSection::Attendance)?,
            "admissions": load_section(conn, SetupSection::Admissions)?,
        }))
    })
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    with_caller(state, req, |conn, caller, params| {
        caller.require(&[Role::Ceo])?;
        let section_raw = get_required_str(params, "section")?;
        let section = SetupSection::parse(section_raw)
            .ok_or_else(|| AppError::bad_params("unknown section"))?;
        let patch_obj = params
            .get("patch")
            .and_then(|v| v.as_object())
            .ok_or_else(|| AppError::bad_params("patch must be an object"))?;
        let mut current = load_section(conn, section)?;
        merge_section_patch(section, &mut current, patch_obj).map_err(AppError::BadParams)?;
        db::settings_set_json(conn, section.key(), &current)?;
        info!(section = section.key(), "setup updated");
        Ok(json!({ "section": section_raw, "values": current }))
    })
}

// First CEO account; only possible while the users table is empty.
fn handle_setup_bootstrap(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let tx = conn.unchecked_transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        if existing > 0 {
            return Err(AppError::forbidden("workspace already has users"));
        }
        let password = params
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::bad_params("missing password"))?;
        let user_id = insert_user(
            &tx,
            &NewUser {
                email: get_required_str(params, "email")?,
                password,
                full_name: get_required_str(params, "fullName")?,
                role: Role::Ceo,
                branch_id: None,
            },
        )?;
        tx.commit()?;
        info!(user_id = %user_id, "bootstrapped first CEO account");
        Ok(json!({ "userId": user_id }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "setup.bootstrap" => Some(handle_setup_bootstrap(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_values_override_defaults_and_bad_ones_are_ignored() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        assert_eq!(attendance_policy(&conn).expect("defaults").periods_per_day, 8);

        db::settings_set_json(
            &conn,
            "setup.attendance",
            &json!({ "periodsPerDay": 4, "allowFutureDates": "yes" }),
        )
        .expect("save");
        let policy = attendance_policy(&conn).expect("policy");
        assert_eq!(policy.periods_per_day, 4);
        assert!(!policy.allow_future_dates);
    }

    #[test]
    fn patch_rejects_unknown_and_out_of_range_fields() {
        let mut current = default_section(SetupSection::Attendance);
        let bad = json!({ "periodsPerDay": 13 });
        assert!(merge_section_patch(
            SetupSection::Attendance,
            &mut current,
            bad.as_object().expect("obj")
        )
        .is_err());
        let unknown = json!({ "colour": "red" });
        assert!(merge_section_patch(
            SetupSection::Attendance,
            &mut current,
            unknown.as_object().expect("obj")
        )
        .is_err());

        let mut adm = default_section(SetupSection::Admissions);
        let ok_patch = json!({ "numberPrefix": "fc" });
        merge_section_patch(
            SetupSection::Admissions,
            &mut adm,
            ok_patch.as_object().expect("obj"),
        )
        .expect("prefix");
        assert_eq!(adm["numberPrefix"], "FC");
    }
}
