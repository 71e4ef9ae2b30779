//! Engine-level error types.
//!
//! A duplicate trigger is deliberately absent: folding a trigger into the
//! existing open alert is a normal `create_or_merge` result, not a failure.

use thiserror::Error;
use uuid::Uuid;

use super::evaluator::EvaluationError;
use super::rules::RuleConfigError;
use crate::db::DatabaseError;
use crate::models::enums::AlertState;

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error("Invalid transition for alert {alert_id}: {current} -> {requested}")]
    InvalidTransition {
        alert_id: Uuid,
        current: AlertState,
        requested: AlertState,
    },

    #[error("Alert {alert_id} is closed ({state})")]
    AlertClosed { alert_id: Uuid, state: AlertState },

    #[error("Rule evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Rule configuration error: {0}")]
    Rules(#[from] RuleConfigError),

    #[error("Alert store lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for TriageError {
    fn from(err: rusqlite::Error) -> Self {
        TriageError::Database(DatabaseError::Sqlite(err))
    }
}
