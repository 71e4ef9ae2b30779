//! Repository layer — table-scoped database operations for the alert lifecycle.
//!
//! Functions take a `&Connection` so callers can run them inside a
//! `rusqlite::Transaction` (which derefs to `Connection`) when several writes
//! must commit together.

mod alert;
mod attempt;
mod history;
mod rolling_state;
mod signal_log;

use uuid::Uuid;

use super::DatabaseError;

pub use alert::*;
pub use attempt::*;
pub use history::*;
pub use rolling_state::*;
pub use signal_log::*;

/// Parse a TEXT uuid column.
pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

/// True when a SQLite error is a UNIQUE (or primary-key) constraint failure.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}
