//! Domain error taxonomy shared by every ledger service.

use thiserror::Error;

use crate::db::DbError;

/// Errors surfaced by ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Patient, version, segment or MRN pointer absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing required field, malformed content or disallowed value.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No checklist entry for the requested stage pair.
    #[error("Transition not allowed: {from} -> {to}")]
    TransitionNotAllowed { from: String, to: String },

    /// A write precondition failed; re-read and retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backing store failed; nothing was written.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<DbError> for LedgerError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConditionFailed { .. } => LedgerError::Conflict(e.to_string()),
            DbError::InvalidCursor(msg) => LedgerError::Validation(format!("invalid cursor: {}", msg)),
            other => LedgerError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
