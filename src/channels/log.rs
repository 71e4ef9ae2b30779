use async_trait::async_trait;

use super::{ChannelError, NotificationChannel, NotificationMessage};
use crate::models::enums::ChannelKind;
use crate::triage::rules::EscalationTier;

/// Writes notifications to the tracing log. Used when no provider is
/// configured for a kind, so alerts still surface somewhere.
#[derive(Debug, Clone)]
pub struct LogChannel {
    kind: ChannelKind,
}

impl LogChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        subject_id: &str,
        tier: &EscalationTier,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError> {
        tracing::info!(
            channel = %self.kind,
            alert_id = %message.alert_id,
            subject_id,
            responder = %tier.responder,
            severity = %message.severity,
            "{}",
            message.summary
        );
        Ok(())
    }
}
