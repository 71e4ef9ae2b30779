//! Responder actions: acknowledge, resolve, cancel, reassign.
//!
//! Every action goes through the store's compare-and-set. The tracker reads
//! the current state, attempts the transition from it, and retries once if
//! the scheduler moved the alert in between (Pending -> Escalated). A
//! successful acknowledgment or close cancels the SLA timer.

use std::sync::Arc;

use uuid::Uuid;

use super::error::TriageError;
use super::events::{EngineEvent, EventBus};
use super::scheduler::EscalationScheduler;
use super::store::AlertStore;
use crate::models::enums::AlertState;
use crate::models::Alert;

/// Actor recorded when no person cancels an alert.
pub const SYSTEM_ACTOR: &str = "system";

pub struct ResponseTracker {
    store: Arc<AlertStore>,
    scheduler: Arc<EscalationScheduler>,
    events: EventBus,
}

impl ResponseTracker {
    pub fn new(store: Arc<AlertStore>, scheduler: Arc<EscalationScheduler>, events: EventBus) -> Self {
        Self {
            store,
            scheduler,
            events,
        }
    }

    /// Stop the SLA clock. Repeating the acknowledgment as the same
    /// responder is a no-op; another responder must use `reassign`.
    pub fn acknowledge(&self, alert_id: Uuid, responder: &str) -> Result<Alert, TriageError> {
        let alert = self.store.get(alert_id)?;
        if alert.state == AlertState::Acknowledged
            && alert.acknowledged_by.as_deref() == Some(responder)
        {
            return Ok(alert);
        }

        let updated = match self.transition_from_current(alert, AlertState::Acknowledged, responder, None) {
            Ok(updated) => updated,
            // A concurrent acknowledgment won the CAS; it may have been ours.
            Err(TriageError::InvalidTransition {
                current: AlertState::Acknowledged,
                ..
            }) => return self.already_acknowledged(alert_id, responder),
            Err(e) => return Err(e),
        };
        self.scheduler.cancel(alert_id);
        tracing::info!(alert_id = %alert_id, responder, tier = updated.current_tier_index, "Alert acknowledged");
        self.events.publish(EngineEvent::Acknowledged {
            alert_id,
            responder: responder.to_string(),
        });
        Ok(updated)
    }

    pub fn resolve(
        &self,
        alert_id: Uuid,
        responder: &str,
        notes: Option<&str>,
    ) -> Result<Alert, TriageError> {
        let alert = self.store.get(alert_id)?;
        let updated = self.transition_from_current(alert, AlertState::Resolved, responder, notes)?;
        self.scheduler.cancel(alert_id);
        tracing::info!(alert_id = %alert_id, responder, "Alert resolved");
        self.events.publish(EngineEvent::Resolved {
            alert_id,
            responder: responder.to_string(),
        });
        Ok(updated)
    }

    pub fn cancel(&self, alert_id: Uuid, reason: &str) -> Result<Alert, TriageError> {
        self.cancel_as(alert_id, SYSTEM_ACTOR, reason)
    }

    pub fn cancel_as(&self, alert_id: Uuid, actor: &str, reason: &str) -> Result<Alert, TriageError> {
        let alert = self.store.get(alert_id)?;
        let updated =
            self.transition_from_current(alert, AlertState::Cancelled, actor, Some(reason))?;
        self.scheduler.cancel(alert_id);
        tracing::info!(alert_id = %alert_id, actor, reason, "Alert cancelled");
        self.events.publish(EngineEvent::Cancelled {
            alert_id,
            reason: reason.to_string(),
        });
        Ok(updated)
    }

    /// Hand the alert to someone else. The SLA clock is not affected.
    pub fn reassign(&self, alert_id: Uuid, actor: &str, assignee: &str) -> Result<Alert, TriageError> {
        let updated = self.store.reassign(alert_id, actor, assignee)?;
        tracing::info!(alert_id = %alert_id, actor, assignee, "Alert reassigned");
        self.events.publish(EngineEvent::Reassigned {
            alert_id,
            assignee: assignee.to_string(),
        });
        Ok(updated)
    }

    fn already_acknowledged(&self, alert_id: Uuid, responder: &str) -> Result<Alert, TriageError> {
        let current = self.store.get(alert_id)?;
        if current.state == AlertState::Acknowledged
            && current.acknowledged_by.as_deref() == Some(responder)
        {
            return Ok(current);
        }
        Err(TriageError::InvalidTransition {
            alert_id,
            current: current.state,
            requested: AlertState::Acknowledged,
        })
    }

    fn transition_from_current(
        &self,
        alert: Alert,
        to: AlertState,
        actor: &str,
        note: Option<&str>,
    ) -> Result<Alert, TriageError> {
        match self.store.transition(alert.id, alert.state, to, actor, note) {
            Err(TriageError::InvalidTransition { current, .. })
                if current != alert.state && current.can_transition_to(to) =>
            {
                tracing::debug!(alert_id = %alert.id, from = %current, "State moved during transition, retrying");
                self.store.transition(alert.id, current, to, actor, note)
            }
            other => other,
        }
    }
}
