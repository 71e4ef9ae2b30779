use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::{ChannelKind, DeliveryOutcome};
use crate::models::NotificationAttempt;

/// Record an attempt. Attempts start as `Pending` so an interrupted send
/// still leaves an audit row.
pub fn insert_attempt(
    conn: &Connection,
    attempt: &NotificationAttempt,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO notification_attempts
         (id, alert_id, tier_index, channel, attempt_number, sent_at, outcome, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            attempt.id.to_string(),
            attempt.alert_id.to_string(),
            attempt.tier_index,
            attempt.channel.as_str(),
            attempt.attempt_number,
            attempt.sent_at,
            attempt.outcome.as_str(),
            attempt.detail,
        ],
    )?;
    Ok(())
}

/// Set the final outcome of a pending attempt. Returns false if the attempt
/// was already completed (outcomes are written once).
pub fn complete_attempt(
    conn: &Connection,
    attempt_id: &Uuid,
    outcome: DeliveryOutcome,
    detail: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE notification_attempts
         SET outcome = ?1, detail = COALESCE(?2, detail), completed_at = ?3
         WHERE id = ?4 AND outcome = 'pending'",
        params![outcome.as_str(), detail, completed_at, attempt_id.to_string()],
    )?;
    Ok(updated == 1)
}

/// All attempts for an alert in the order they were made.
pub fn list_attempts(
    conn: &Connection,
    alert_id: &Uuid,
) -> Result<Vec<NotificationAttempt>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, alert_id, tier_index, channel, attempt_number, sent_at, outcome, detail
         FROM notification_attempts
         WHERE alert_id = ?1
         ORDER BY rowid ASC",
    )?;

    let rows = stmt.query_map(params![alert_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u32>(4)?,
            row.get::<_, DateTime<Utc>>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;

    let mut attempts = Vec::new();
    for row in rows {
        let (id, alert_id, tier_index, channel, attempt_number, sent_at, outcome, detail) = row?;
        attempts.push(NotificationAttempt {
            id: parse_uuid(&id)?,
            alert_id: parse_uuid(&alert_id)?,
            tier_index,
            channel: ChannelKind::from_str(&channel)?,
            attempt_number,
            sent_at,
            outcome: DeliveryOutcome::from_str(&outcome)?,
            detail,
        });
    }
    Ok(attempts)
}
