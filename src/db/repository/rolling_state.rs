use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::triage::evaluator::RollingState;

/// Identity of one rolling-state slot: a rule's view of one subject (and,
/// for item-scoped rules, one prescription, appointment or symptom).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollingStateKey {
    pub subject_id: String,
    pub rule_id: String,
    /// Empty for subject-scoped rules.
    pub scope_key: String,
}

/// Load a slot, defaulting to an empty state when none is stored yet.
pub fn load_rolling_state(
    conn: &Connection,
    key: &RollingStateKey,
) -> Result<RollingState, DatabaseError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT state_json FROM rolling_state
             WHERE subject_id = ?1 AND rule_id = ?2 AND scope_key = ?3",
            params![key.subject_id, key.rule_id, key.scope_key],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(RollingState::default()),
    }
}

pub fn save_rolling_state(
    conn: &Connection,
    key: &RollingStateKey,
    state: &RollingState,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let json = serde_json::to_string(state)?;
    conn.execute(
        "INSERT INTO rolling_state (subject_id, rule_id, scope_key, state_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (subject_id, rule_id, scope_key)
         DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
        params![key.subject_id, key.rule_id, key.scope_key, json, now],
    )?;
    Ok(())
}
