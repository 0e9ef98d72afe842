use rusqlite::types::Value;

use crate::auth::Caller;
use crate::error::{AppError, AppResult};

/// Row filter derived from the caller. CEO sees every branch; everyone else sees their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchScope {
    All,
    Branch(String),
}

impl BranchScope {
    pub fn for_caller(caller: &Caller) -> AppResult<Self> {
        if caller.is_ceo() {
            return Ok(Self::All);
        }
        caller
            .branch_id
            .clone()
            .map(Self::Branch)
            .ok_or_else(|| AppError::forbidden("account is not assigned to a branch"))
    }

    /// Appends `AND <column> = ?` for branch-scoped callers.
    pub fn push_clause(&self, column: &str, sql: &mut String, binds: &mut Vec<Value>) {
        if let Self::Branch(id) = self {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(Value::Text(id.clone()));
        }
    }

    pub fn allows(&self, branch_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Branch(id) => id == branch_id,
        }
    }

    /// Resolves the branch a write lands in. Branch-scoped callers may only name their own.
    pub fn write_branch(&self, requested: Option<&str>) -> AppResult<String> {
        match (self, requested) {
            (Self::All, Some(b)) => Ok(b.to_string()),
            (Self::All, None) => Err(AppError::bad_params("missing branchId")),
            (Self::Branch(own), None) => Ok(own.clone()),
            (Self::Branch(own), Some(b)) if b == own => Ok(own.clone()),
            (Self::Branch(_), Some(_)) => {
                Err(AppError::forbidden("cannot write to another branch"))
            }
        }
    }
}
