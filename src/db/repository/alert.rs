use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::{AlertState, Severity};
use crate::models::{Alert, AlertFilter};

const ALERT_COLUMNS: &str = "id, subject_id, rule_id, severity, fingerprint, state,
     created_at, updated_at, current_tier_index, tier_deadline,
     acknowledged_by, resolved_by, assignee, resolution_notes";

/// Raw column values; enum and uuid parsing happens outside the row closure
/// so failures surface as `DatabaseError` rather than `rusqlite::Error`.
struct AlertRow {
    id: String,
    subject_id: String,
    rule_id: String,
    severity: String,
    fingerprint: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    current_tier_index: u32,
    tier_deadline: Option<DateTime<Utc>>,
    acknowledged_by: Option<String>,
    resolved_by: Option<String>,
    assignee: Option<String>,
    resolution_notes: Option<String>,
}

impl AlertRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            rule_id: row.get(2)?,
            severity: row.get(3)?,
            fingerprint: row.get(4)?,
            state: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            current_tier_index: row.get(8)?,
            tier_deadline: row.get(9)?,
            acknowledged_by: row.get(10)?,
            resolved_by: row.get(11)?,
            assignee: row.get(12)?,
            resolution_notes: row.get(13)?,
        })
    }

    fn into_alert(self) -> Result<Alert, DatabaseError> {
        Ok(Alert {
            id: parse_uuid(&self.id)?,
            subject_id: self.subject_id,
            rule_id: self.rule_id,
            severity: Severity::from_str(&self.severity)?,
            fingerprint: self.fingerprint,
            state: AlertState::from_str(&self.state)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            current_tier_index: self.current_tier_index,
            tier_deadline: self.tier_deadline,
            acknowledged_by: self.acknowledged_by,
            resolved_by: self.resolved_by,
            assignee: self.assignee,
            resolution_notes: self.resolution_notes,
        })
    }
}

/// Insert a new alert. A second open alert for the same fingerprint fails
/// with a UNIQUE constraint error (see `is_unique_violation`).
pub fn insert_alert(conn: &Connection, alert: &Alert) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO alerts
         (id, subject_id, rule_id, severity, fingerprint, state, created_at, updated_at,
          current_tier_index, tier_deadline, acknowledged_by, resolved_by, assignee,
          resolution_notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            alert.id.to_string(),
            alert.subject_id,
            alert.rule_id,
            alert.severity.as_str(),
            alert.fingerprint,
            alert.state.as_str(),
            alert.created_at,
            alert.updated_at,
            alert.current_tier_index,
            alert.tier_deadline,
            alert.acknowledged_by,
            alert.resolved_by,
            alert.assignee,
            alert.resolution_notes,
        ],
    )?;
    Ok(())
}

pub fn get_alert(conn: &Connection, id: &Uuid) -> Result<Option<Alert>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            params![id.to_string()],
            AlertRow::from_row,
        )
        .optional()?;
    row.map(AlertRow::into_alert).transpose()
}

/// The open (non-terminal) alert for a fingerprint, if any.
pub fn get_open_alert_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<Alert>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE fingerprint = ?1
                   AND state IN ('pending', 'acknowledged', 'escalated')"
            ),
            params![fingerprint],
            AlertRow::from_row,
        )
        .optional()?;
    row.map(AlertRow::into_alert).transpose()
}

/// Open alerts matching the filter, most severe first, then oldest first.
pub fn list_open_alerts(
    conn: &Connection,
    filter: &AlertFilter,
) -> Result<Vec<Alert>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts
         WHERE state IN ('pending', 'acknowledged', 'escalated')
           AND (?1 IS NULL OR severity = ?1)
           AND (?2 IS NULL OR current_tier_index = ?2)
           AND (?3 IS NULL OR assignee = ?3)
           AND (?4 IS NULL OR state = ?4)
         ORDER BY CASE severity
                      WHEN 'critical' THEN 0
                      WHEN 'high' THEN 1
                      WHEN 'medium' THEN 2
                      ELSE 3
                  END,
                  created_at ASC"
    ))?;

    let rows = stmt.query_map(
        params![
            filter.severity.map(|s| s.as_str()),
            filter.tier,
            filter.assignee,
            filter.state.map(|s| s.as_str()),
        ],
        AlertRow::from_row,
    )?;

    let mut alerts = Vec::new();
    for row in rows {
        alerts.push(row?.into_alert()?);
    }
    Ok(alerts)
}

/// Alerts with a running SLA clock (Pending or Escalated with a deadline).
pub fn list_schedulable_alerts(conn: &Connection) -> Result<Vec<Alert>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts
         WHERE state IN ('pending', 'escalated') AND tier_deadline IS NOT NULL
         ORDER BY tier_deadline ASC"
    ))?;
    let rows = stmt.query_map([], AlertRow::from_row)?;

    let mut alerts = Vec::new();
    for row in rows {
        alerts.push(row?.into_alert()?);
    }
    Ok(alerts)
}

/// Column updates applied together with a state change.
#[derive(Debug, Default)]
pub struct StateChange<'a> {
    pub clear_deadline: bool,
    pub acknowledged_by: Option<&'a str>,
    pub resolved_by: Option<&'a str>,
    pub assignee: Option<&'a str>,
    pub resolution_notes: Option<&'a str>,
}

/// Compare-and-set on the state column. Returns false when the stored state
/// is not `from` (or the alert does not exist); nothing is written then.
pub fn compare_and_set_state(
    conn: &Connection,
    id: &Uuid,
    from: AlertState,
    to: AlertState,
    change: &StateChange<'_>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE alerts
         SET state = ?1,
             updated_at = ?2,
             tier_deadline = CASE WHEN ?3 THEN NULL ELSE tier_deadline END,
             acknowledged_by = COALESCE(?4, acknowledged_by),
             resolved_by = COALESCE(?5, resolved_by),
             assignee = COALESCE(?6, assignee),
             resolution_notes = COALESCE(?7, resolution_notes)
         WHERE id = ?8 AND state = ?9",
        params![
            to.as_str(),
            now,
            change.clear_deadline,
            change.acknowledged_by,
            change.resolved_by,
            change.assignee,
            change.resolution_notes,
            id.to_string(),
            from.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

/// Compare-and-set on (state, tier) that moves the alert to `Escalated` at
/// `to_tier` with a fresh deadline.
pub fn compare_and_escalate(
    conn: &Connection,
    id: &Uuid,
    from_state: AlertState,
    from_tier: u32,
    to_tier: u32,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE alerts
         SET state = 'escalated', current_tier_index = ?1, tier_deadline = ?2, updated_at = ?3
         WHERE id = ?4 AND state = ?5 AND current_tier_index = ?6",
        params![
            to_tier,
            deadline,
            now,
            id.to_string(),
            from_state.as_str(),
            from_tier,
        ],
    )?;
    Ok(updated == 1)
}

/// Change the assignee of a non-terminal alert.
pub fn set_assignee(
    conn: &Connection,
    id: &Uuid,
    assignee: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE alerts SET assignee = ?1, updated_at = ?2
         WHERE id = ?3 AND state IN ('pending', 'acknowledged', 'escalated')",
        params![assignee, now, id.to_string()],
    )?;
    Ok(updated == 1)
}
