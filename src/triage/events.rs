//! Engine lifecycle events, fanned out over a broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::enums::Severity;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    AlertCreated {
        alert_id: Uuid,
        rule_id: String,
        subject_id: String,
        severity: Severity,
    },
    AlertMerged {
        alert_id: Uuid,
        signal_id: Uuid,
    },
    Escalated {
        alert_id: Uuid,
        tier_index: u32,
    },
    Repeated {
        alert_id: Uuid,
        tier_index: u32,
    },
    Acknowledged {
        alert_id: Uuid,
        responder: String,
    },
    Resolved {
        alert_id: Uuid,
        responder: String,
    },
    Cancelled {
        alert_id: Uuid,
        reason: String,
    },
    Reassigned {
        alert_id: Uuid,
        assignee: String,
    },
    /// Every channel of a tier failed; the SLA clock keeps running.
    DispatchExhausted {
        alert_id: Uuid,
        tier_index: u32,
        attempts: usize,
    },
    SignalDropped {
        subject_id: String,
        reason: String,
    },
}

/// Cloneable publisher handle. Publishing never blocks; slow subscribers
/// lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
