use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

pub const DB_FILE: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL,
            branch_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_branch ON users(branch_id)",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)", [])?;
    migrate_channel_partner_role(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            duration_weeks INTEGER,
            fee REAL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            UNIQUE(branch_id, code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trainers(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            employee_id TEXT NOT NULL UNIQUE,
            specialization TEXT,
            joined_on TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainers_branch ON trainers(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS leads(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            created_by TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            source TEXT NOT NULL,
            course_id TEXT,
            status TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(created_by) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_leads_branch_status ON leads(branch_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admissions(
            id TEXT PRIMARY KEY,
            admission_no TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            lead_id TEXT,
            full_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            qualification TEXT,
            total_fee REAL NOT NULL DEFAULT 0,
            fee_paid REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(lead_id) REFERENCES leads(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_admissions_branch_status ON admissions(branch_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_admissions_email ON admissions(email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            trainer_id TEXT,
            name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            start_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(trainer_id) REFERENCES trainers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_branch ON batches(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            admission_id TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            batch_id TEXT,
            enrolled_on TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(admission_id) REFERENCES admissions(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_branch ON students(branch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;

    ensure_attendance_period_key(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_course_date ON attendance(course_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_growth_reports(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            trainer_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            period_label TEXT NOT NULL,
            rating INTEGER NOT NULL,
            strengths TEXT,
            improvements TEXT,
            remarks TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(trainer_id) REFERENCES trainers(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_growth_reports_student ON student_growth_reports(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branch_reports(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            author_user_id TEXT NOT NULL,
            report_date TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(author_user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_branch_reports_branch ON branch_reports(branch_id, report_date)",
        [],
    )?;

    Ok(())
}

const ATTENDANCE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS attendance(
    id TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    course_id TEXT NOT NULL,
    date TEXT NOT NULL,
    period INTEGER NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('PRESENT', 'ABSENT')),
    verified INTEGER NOT NULL DEFAULT 0,
    marked_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    FOREIGN KEY(student_id) REFERENCES students(id),
    FOREIGN KEY(course_id) REFERENCES courses(id),
    FOREIGN KEY(marked_by) REFERENCES users(id),
    UNIQUE(student_id, course_id, date, period)
)";

// Older stores keyed attendance on (student, course, date), which collapsed every period of
// a day into one row. Rebuild those under the four-column key with period 1.
fn ensure_attendance_period_key(conn: &Connection) -> anyhow::Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'attendance'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        conn.execute(ATTENDANCE_TABLE_SQL, [])?;
        return Ok(());
    }
    if table_has_column(conn, "attendance", "period")? {
        return Ok(());
    }

    // Table rebuilds run with enforcement off; it cannot be toggled inside a transaction.
    conn.execute("PRAGMA foreign_keys = OFF", [])?;
    let rebuilt = rebuild_attendance(conn);
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    let copied = rebuilt?;
    info!(rows = copied, "migrated attendance to per-period uniqueness");
    Ok(())
}

fn rebuild_attendance(conn: &Connection) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("ALTER TABLE attendance RENAME TO attendance_legacy", [])?;
    tx.execute(ATTENDANCE_TABLE_SQL, [])?;
    let has_verified = table_has_column(&tx, "attendance_legacy", "verified")?;
    let has_marked_by = table_has_column(&tx, "attendance_legacy", "marked_by")?;
    let copy_sql = format!(
        "INSERT INTO attendance(id, student_id, course_id, date, period, status, verified, marked_by, created_at, updated_at)
         SELECT id, student_id, course_id, date, 1, upper(status), {}, {}, created_at, updated_at
         FROM attendance_legacy",
        if has_verified { "verified" } else { "0" },
        if has_marked_by { "marked_by" } else { "NULL" },
    );
    let copied = tx.execute(&copy_sql, [])?;
    tx.execute("DROP TABLE attendance_legacy", [])?;
    tx.commit()?;
    Ok(copied)
}

// Branch heads were once stored as CHANNEL_PARTNER.
fn migrate_channel_partner_role(conn: &Connection) -> anyhow::Result<()> {
    let n = conn.execute(
        "UPDATE users SET role = 'BRANCH_HEAD' WHERE role = 'CHANNEL_PARTNER'",
        [],
    )?;
    if n > 0 {
        info!(rows = n, "renamed CHANNEL_PARTNER users to BRANCH_HEAD");
    }
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Next `<prefix>NNNN` value for a numbered code column, one past the highest in use.
pub fn next_sequence_code(
    conn: &Connection,
    table: &str,
    column: &str,
    prefix: &str,
) -> anyhow::Result<String> {
    let sql = format!(
        "SELECT {col} FROM {table} WHERE substr({col}, 1, ?) = ?",
        col = column,
        table = table
    );
    let mut stmt = conn.prepare(&sql)?;
    let codes = stmt
        .query_map((prefix.len() as i64, prefix), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let max = codes
        .iter()
        .filter_map(|c| c.strip_prefix(prefix))
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let next = max
        .checked_add(1)
        .ok_or_else(|| anyhow::anyhow!("no sequence numbers left after {}{}", prefix, max))?;
    Ok(format!("{}{:04}", prefix, next))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "attendance", "period").expect("pragma"));
    }

    #[test]
    fn legacy_attendance_is_rebuilt_with_period_key() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE attendance(
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE(student_id, course_id, date)
            );
            INSERT INTO attendance VALUES('a1', 's1', 'c1', '2024-03-01', 'PRESENT', 'x', NULL);",
        )
        .expect("legacy schema");

        // Legacy rows point at students that never existed in this store.
        conn.execute("PRAGMA foreign_keys = ON", []).expect("fk on");
        ensure_attendance_period_key(&conn).expect("migrate");

        let (period, verified): (i64, i64) = conn
            .query_row(
                "SELECT period, verified FROM attendance WHERE id = 'a1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("migrated row");
        assert_eq!(period, 1);
        assert_eq!(verified, 0);

        // The widened key admits a second period on the same day.
        conn.execute(
            "INSERT INTO attendance(id, student_id, course_id, date, period, status, created_at)
             VALUES('a2', 's1', 'c1', '2024-03-01', 2, 'ABSENT', 'x')",
            [],
        )
        .expect("second period");
        let legacy_left: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'attendance_legacy'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(legacy_left, 0);
    }

    #[test]
    fn sequence_codes_skip_past_the_highest() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        assert_eq!(
            next_sequence_code(&conn, "branches", "code", "EMP-SLM-").expect("empty"),
            "EMP-SLM-0001"
        );
        conn.execute_batch(
            "INSERT INTO branches(id, name, code, created_at) VALUES
               ('1', 'a', 'EMP-SLM-0007', 'x'),
               ('2', 'b', 'EMP-SLM-0002', 'x'),
               ('3', 'c', 'EMP-SLMX-0099', 'x'),
               ('4', 'd', 'EMP-SLM-custom', 'x');",
        )
        .expect("seed");
        assert_eq!(
            next_sequence_code(&conn, "branches", "code", "EMP-SLM-").expect("next"),
            "EMP-SLM-0008"
        );
    }

    #[test]
    fn sequence_codes_widen_past_u32_and_fail_when_exhausted() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        conn.execute(
            "INSERT INTO branches(id, name, code, created_at) VALUES('1', 'a', 'EMP-SLM-4294967295', 'x')",
            [],
        )
        .expect("seed");
        assert_eq!(
            next_sequence_code(&conn, "branches", "code", "EMP-SLM-").expect("next"),
            "EMP-SLM-4294967296"
        );
        conn.execute(
            "INSERT INTO branches(id, name, code, created_at) VALUES('2', 'b', 'EMP-SLM-18446744073709551615', 'x')",
            [],
        )
        .expect("seed max");
        assert!(next_sequence_code(&conn, "branches", "code", "EMP-SLM-").is_err());
    }

    #[test]
    fn settings_roundtrip_overwrites() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        assert!(settings_get_json(&conn, "k").expect("get").is_none());
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("set again");
        assert_eq!(
            settings_get_json(&conn, "k").expect("get"),
            Some(serde_json::json!({ "a": 2 }))
        );
    }
}
