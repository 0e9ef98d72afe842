//! Attendance rows are unique per (student, course, date, period).
//!
//! `upsert` is the normal write path. `insert_strict` surfaces a duplicate key as
//! `AppError::UniqueViolation` for callers that want to detect it themselves.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::now_rfc3339;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRESENT" | "P" => Some(Self::Present),
            "ABSENT" | "A" => Some(Self::Absent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Absent => "ABSENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceKey {
    pub student_id: String,
    pub course_id: String,
    pub date: NaiveDate,
    pub period: u32,
}

impl AttendanceKey {
    fn date_str(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    pub id: String,
    pub created: bool,
}

pub fn parse_date(raw: &str, key: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn validate_period(period: i64, periods_per_day: i64) -> AppResult<u32> {
    if period < 1 || period > periods_per_day {
        return Err(AppError::bad_params(format!(
            "period must be in 1..={}",
            periods_per_day
        )));
    }
    Ok(period as u32)
}

/// Creates the row for an unseen key or overwrites the status of the existing one.
/// A changed mark has to be verified again.
pub fn upsert(
    conn: &Connection,
    key: &AttendanceKey,
    status: AttendanceStatus,
    marked_by: &str,
) -> AppResult<MarkOutcome> {
    let new_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let id: String = conn.query_row(
        "INSERT INTO attendance(id, student_id, course_id, date, period, status, verified, marked_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
         ON CONFLICT(student_id, course_id, date, period) DO UPDATE SET
           status = excluded.status,
           verified = 0,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at
         RETURNING id",
        (
            &new_id,
            &key.student_id,
            &key.course_id,
            key.date_str(),
            key.period,
            status.as_str(),
            marked_by,
            &now,
            &now,
        ),
        |r| r.get(0),
    )?;
    let created = id == new_id;
    Ok(MarkOutcome { id, created })
}

pub fn insert_strict(
    conn: &Connection,
    key: &AttendanceKey,
    status: AttendanceStatus,
    marked_by: &str,
) -> AppResult<String> {
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO attendance(id, student_id, course_id, date, period, status, verified, marked_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        (
            &id,
            &key.student_id,
            &key.course_id,
            key.date_str(),
            key.period,
            status.as_str(),
            marked_by,
            &now,
            &now,
        ),
    )?;
    Ok(id)
}

pub fn find_by_key(conn: &Connection, key: &AttendanceKey) -> AppResult<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT id, status FROM attendance
             WHERE student_id = ? AND course_id = ? AND date = ? AND period = ?",
            (&key.student_id, &key.course_id, key.date_str(), key.period),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?)
}
