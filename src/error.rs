use rusqlite::ffi;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadParams(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{message}")]
    UniqueViolation { message: String },
    #[error("{message}")]
    ForeignKeyViolation { message: String },
    #[error("{entity} still has dependent {dependents} rows")]
    HasDependents {
        entity: &'static str,
        dependents: &'static str,
    },
    #[error("cannot move {entity} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error(transparent)]
    Db(rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::UniqueViolation { .. } => "unique_violation",
            Self::ForeignKeyViolation { .. } => "foreign_key_violation",
            Self::HasDependents { .. } => "has_dependents",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Db(_) => "db_query_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::HasDependents { entity, dependents } => {
                Some(json!({ "entity": entity, "dependents": dependents }))
            }
            Self::InvalidTransition { entity, from, to } => {
                Some(json!({ "entity": entity, "from": from, "to": to }))
            }
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

// Constraint failures get their own codes so callers can take the fallback path.
impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref f, ref msg) = e {
            let message = msg.clone().unwrap_or_else(|| e.to_string());
            match f.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return Self::UniqueViolation { message }
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return Self::ForeignKeyViolation { message }
                }
                _ => {}
            }
        }
        Self::Db(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn classifies_constraint_failures() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent(id TEXT PRIMARY KEY);
             CREATE TABLE child(id TEXT PRIMARY KEY, code TEXT UNIQUE,
               parent_id TEXT REFERENCES parent(id));
             INSERT INTO parent(id) VALUES('p');
             INSERT INTO child(id, code, parent_id) VALUES('c1', 'X', 'p');",
        )
        .expect("schema");

        let dup: AppError = conn
            .execute(
                "INSERT INTO child(id, code, parent_id) VALUES('c2', 'X', 'p')",
                [],
            )
            .expect_err("duplicate code")
            .into();
        assert_eq!(dup.code(), "unique_violation");

        let orphan: AppError = conn
            .execute(
                "INSERT INTO child(id, code, parent_id) VALUES('c3', 'Y', 'missing')",
                [],
            )
            .expect_err("missing parent")
            .into();
        assert_eq!(orphan.code(), "foreign_key_violation");

        let other: AppError = conn
            .execute("SELECT nope FROM child", [])
            .expect_err("bad column")
            .into();
        assert_eq!(other.code(), "db_query_failed");
    }
}
