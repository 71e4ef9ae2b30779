use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::{AlertState, HistoryEvent};
use crate::models::TransitionRecord;

/// Fields of a history entry; the sequence number is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry<'a> {
    pub event: HistoryEvent,
    pub from_state: Option<AlertState>,
    pub to_state: AlertState,
    pub tier_index: u32,
    pub actor: &'a str,
    pub note: Option<&'a str>,
    pub at: DateTime<Utc>,
}

/// Append an entry to an alert's audit trail. Returns the assigned sequence.
pub fn append_history(
    conn: &Connection,
    alert_id: &Uuid,
    entry: &NewHistoryEntry<'_>,
) -> Result<i64, DatabaseError> {
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM alert_history WHERE alert_id = ?1",
        params![alert_id.to_string()],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO alert_history
         (alert_id, sequence, event, from_state, to_state, tier_index, actor, note, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            alert_id.to_string(),
            sequence,
            entry.event.as_str(),
            entry.from_state.map(|s| s.as_str()),
            entry.to_state.as_str(),
            entry.tier_index,
            entry.actor,
            entry.note,
            entry.at,
        ],
    )?;
    Ok(sequence)
}

/// Full audit trail for an alert, oldest first.
pub fn list_history(
    conn: &Connection,
    alert_id: &Uuid,
) -> Result<Vec<TransitionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT alert_id, sequence, event, from_state, to_state, tier_index, actor, note, at
         FROM alert_history
         WHERE alert_id = ?1
         ORDER BY sequence ASC",
    )?;

    let rows = stmt.query_map(params![alert_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, u32>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, DateTime<Utc>>(8)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, sequence, event, from_state, to_state, tier_index, actor, note, at) = row?;
        records.push(TransitionRecord {
            alert_id: parse_uuid(&id)?,
            sequence,
            event: HistoryEvent::from_str(&event)?,
            from_state: from_state.as_deref().map(AlertState::from_str).transpose()?,
            to_state: AlertState::from_str(&to_state)?,
            tier_index,
            actor,
            note,
            at,
        });
    }
    Ok(records)
}
