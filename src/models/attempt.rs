use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ChannelKind, DeliveryOutcome};

/// One delivery try. Written as `Pending` before the send and completed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub tier_index: u32,
    pub channel: ChannelKind,
    pub attempt_number: u32,
    pub sent_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
}
