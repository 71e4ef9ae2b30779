use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AlertState, HistoryEvent, Severity};

/// Central alert entity. One non-terminal alert per fingerprint at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub subject_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub fingerprint: String,
    pub state: AlertState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_tier_index: u32,
    /// Deadline of the running SLA clock. `None` once acknowledged or terminal.
    pub tier_deadline: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
    pub assignee: Option<String>,
    pub resolution_notes: Option<String>,
}

/// Rule evaluator decision that a signal warrants an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub rule_id: String,
    pub subject_id: String,
    pub severity: Severity,
    pub fingerprint: String,
    pub signal_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

/// One entry of an alert's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub alert_id: Uuid,
    pub sequence: i64,
    pub event: HistoryEvent,
    pub from_state: Option<AlertState>,
    pub to_state: AlertState,
    pub tier_index: u32,
    pub actor: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}
