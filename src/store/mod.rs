//! 🗄️ Persistence layer
//!
//! Every operation returns `Result<_, StoreError>` carrying a `StoreErrorKind`, so
//! callers branch on the kind (duplicate vs. unavailable vs. corrupt) instead of
//! catching generic failures.

pub mod sqlite;

pub use sqlite::SqliteStore;

use log::warn;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Duplicate,
    /// Busy/locked/IO; worth one retry
    Unavailable,
    /// CHECK, NOT NULL, foreign-key or trigger constraint refused the write
    Rejected,
    /// Stored data could not be decoded
    Corrupt,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::Duplicate => "duplicate",
            StoreErrorKind::Unavailable => "unavailable",
            StoreErrorKind::Rejected => "rejected",
            StoreErrorKind::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("store {kind} during {operation}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub operation: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    pub fn corrupt(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Corrupt, operation, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StoreErrorKind::Unavailable
    }

    /// Classify a rusqlite error
    pub fn from_sqlite(operation: &'static str, err: rusqlite::Error) -> Self {
        use rusqlite::{ffi, ErrorCode};

        let kind = match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreErrorKind::NotFound,
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::ConstraintViolation => match e.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => StoreErrorKind::Duplicate,
                    _ => StoreErrorKind::Rejected,
                },
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreErrorKind::Corrupt,
                _ => StoreErrorKind::Unavailable,
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreErrorKind::Corrupt,
            _ => StoreErrorKind::Unavailable,
        };
        Self::new(kind, operation, err.to_string())
    }
}

/// Run a statement, retrying exactly once when the failure is transient
pub fn retry_once<T, F>(operation: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    match op() {
        Ok(v) => Ok(v),
        Err(e) if e.is_retryable() => {
            warn!("⚠️ {} failed ({}), retrying once", operation, e);
            op()
        }
        Err(e) => Err(e),
    }
}
