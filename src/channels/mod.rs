//! Notification channels: the boundary to push, SMS and voice providers.
//!
//! The dispatcher only sees `NotificationChannel`; concrete providers are
//! registered per `ChannelKind` at startup.

pub mod log;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::enums::{ChannelKind, Severity};
use crate::models::Alert;
use crate::triage::rules::EscalationTier;

pub use self::log::LogChannel;
pub use webhook::WebhookChannel;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Provider rejected the notification: {0}")]
    Rejected(String),

    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    #[error("Provider timed out")]
    TimedOut,
}

/// What a responder is told. A one-line machine summary; wording and
/// localization belong to the provider side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMessage {
    pub alert_id: Uuid,
    pub subject_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub tier_index: u32,
    pub tier_name: String,
    pub responder: String,
    pub summary: String,
}

impl NotificationMessage {
    pub fn for_alert(alert: &Alert, tier: &EscalationTier, tier_index: u32) -> Self {
        Self {
            alert_id: alert.id,
            subject_id: alert.subject_id.clone(),
            rule_id: alert.rule_id.clone(),
            severity: alert.severity,
            tier_index,
            tier_name: tier.name.clone(),
            responder: tier.responder.clone(),
            summary: format!(
                "[{}] {} for {} (tier {} {})",
                alert.severity, alert.rule_id, alert.subject_id, tier_index, tier.name
            ),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(
        &self,
        subject_id: &str,
        tier: &EscalationTier,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError>;
}

/// Channel providers by kind.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any earlier one of the same kind.
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn with(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.register(channel);
        self
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<_> = self.channels.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
