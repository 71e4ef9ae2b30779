use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{ChannelError, NotificationChannel, NotificationMessage};
use crate::models::enums::ChannelKind;
use crate::triage::rules::EscalationTier;

/// Delivers notifications as a JSON POST to a provider relay (SMS gateway,
/// push relay, voice dialer). Any 2xx counts as delivered.
pub struct WebhookChannel {
    kind: ChannelKind,
    url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    channel: ChannelKind,
    subject_id: &'a str,
    responder: &'a str,
    tier: &'a str,
    message: &'a NotificationMessage,
}

impl WebhookChannel {
    pub fn new(kind: ChannelKind, url: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Unreachable(format!("HTTP client: {e}")))?;
        Ok(Self {
            kind,
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        subject_id: &str,
        tier: &EscalationTier,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError> {
        let body = WebhookBody {
            channel: self.kind,
            subject_id,
            responder: &tier.responder,
            tier: &tier.name,
            message,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::TimedOut
                } else {
                    ChannelError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::Rejected(format!("{}: {}", status.as_u16(), body)))
        } else {
            Err(ChannelError::Unreachable(format!("status {}", status.as_u16())))
        }
    }
}
