//! Alert store: the single source of truth for alert state.
//!
//! Wraps the repository functions around one SQLite connection. The mutex is
//! held for one statement or transaction at a time, never across a send or
//! a sleep. Correctness does not rest on it: duplicate creation is stopped
//! by the partial unique index on open fingerprints and lost updates by the
//! `WHERE state = ?` compare-and-set.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use super::clock::Clock;
use super::error::TriageError;
use super::evaluator::{EvaluationError, RollingState};
use crate::db::repository::{self, NewHistoryEntry, RollingStateKey, StateChange};
use crate::db::sqlite::{open_database, open_memory_database};
use crate::db::DatabaseError;
use crate::models::enums::{AlertState, ChannelKind, DeliveryOutcome, HistoryEvent};
use crate::models::{Alert, AlertFilter, AlertTrigger, NotificationAttempt, Signal, TransitionRecord};

/// Actor recorded for scheduler-driven history entries.
pub const SCHEDULER_ACTOR: &str = "system:scheduler";

pub struct AlertStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl AlertStore {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock,
        }
    }

    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, TriageError> {
        Ok(Self::new(open_database(path)?, clock))
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, TriageError> {
        Ok(Self::new(open_memory_database()?, clock))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TriageError> {
        self.conn.lock().map_err(|_| TriageError::LockPoisoned)
    }

    // ── Alerts ──────────────────────────────────────────────

    /// Insert a Pending alert for the trigger, or return the open alert that
    /// already owns its fingerprint. The bool is true when a new alert was
    /// created.
    pub fn create_or_merge(
        &self,
        trigger: &AlertTrigger,
        first_deadline: DateTime<Utc>,
    ) -> Result<(Alert, bool), TriageError> {
        let now = self.clock.now();
        let alert = Alert {
            id: Uuid::new_v4(),
            subject_id: trigger.subject_id.clone(),
            rule_id: trigger.rule_id.clone(),
            severity: trigger.severity,
            fingerprint: trigger.fingerprint.clone(),
            state: AlertState::Pending,
            created_at: now,
            updated_at: now,
            current_tier_index: 0,
            tier_deadline: Some(first_deadline),
            acknowledged_by: None,
            resolved_by: None,
            assignee: None,
            resolution_notes: None,
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match repository::insert_alert(&tx, &alert) {
            Ok(()) => {
                let note = format!("signal {}", trigger.signal_id);
                repository::append_history(
                    &tx,
                    &alert.id,
                    &NewHistoryEntry {
                        event: HistoryEvent::Created,
                        from_state: None,
                        to_state: AlertState::Pending,
                        tier_index: 0,
                        actor: SCHEDULER_ACTOR,
                        note: Some(&note),
                        at: now,
                    },
                )?;
                tx.commit()?;
                Ok((alert, true))
            }
            Err(DatabaseError::Sqlite(e)) if repository::is_unique_violation(&e) => {
                let existing = repository::get_open_alert_by_fingerprint(&tx, &trigger.fingerprint)?
                    .ok_or_else(|| {
                        DatabaseError::ConstraintViolation(format!(
                            "open alert for {} vanished after unique violation",
                            trigger.fingerprint
                        ))
                    })?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-set a state transition and record it in the history.
    pub fn transition(
        &self,
        alert_id: Uuid,
        from: AlertState,
        to: AlertState,
        actor: &str,
        note: Option<&str>,
    ) -> Result<Alert, TriageError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = repository::get_alert(&tx, &alert_id)?
            .ok_or(TriageError::AlertNotFound(alert_id))?;
        if !from.can_transition_to(to) {
            return Err(TriageError::InvalidTransition {
                alert_id,
                current: current.state,
                requested: to,
            });
        }

        let change = match to {
            AlertState::Acknowledged => StateChange {
                clear_deadline: true,
                acknowledged_by: Some(actor),
                assignee: Some(actor),
                ..Default::default()
            },
            AlertState::Resolved => StateChange {
                clear_deadline: true,
                resolved_by: Some(actor),
                resolution_notes: note,
                ..Default::default()
            },
            AlertState::Cancelled => StateChange {
                clear_deadline: true,
                resolution_notes: note,
                ..Default::default()
            },
            AlertState::Pending | AlertState::Escalated => StateChange::default(),
        };

        if !repository::compare_and_set_state(&tx, &alert_id, from, to, &change, now)? {
            return Err(TriageError::InvalidTransition {
                alert_id,
                current: current.state,
                requested: to,
            });
        }
        repository::append_history(
            &tx,
            &alert_id,
            &NewHistoryEntry {
                event: HistoryEvent::Transition,
                from_state: Some(from),
                to_state: to,
                tier_index: current.current_tier_index,
                actor,
                note,
                at: now,
            },
        )?;
        let updated = repository::get_alert(&tx, &alert_id)?
            .ok_or(TriageError::AlertNotFound(alert_id))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Move an alert to `to_tier` (or re-arm it at the same final tier) with
    /// a fresh deadline, provided it is still at `from_state`/`from_tier`.
    pub fn escalate(
        &self,
        alert_id: Uuid,
        from_state: AlertState,
        from_tier: u32,
        to_tier: u32,
        deadline: DateTime<Utc>,
    ) -> Result<Alert, TriageError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let moved = from_state.awaits_acknowledgment()
            && repository::compare_and_escalate(
                &tx, &alert_id, from_state, from_tier, to_tier, deadline, now,
            )?;
        if !moved {
            let current = repository::get_alert(&tx, &alert_id)?
                .ok_or(TriageError::AlertNotFound(alert_id))?;
            return Err(TriageError::InvalidTransition {
                alert_id,
                current: current.state,
                requested: AlertState::Escalated,
            });
        }

        let event = if to_tier == from_tier {
            HistoryEvent::FinalTierRepeat
        } else {
            HistoryEvent::TierAdvanced
        };
        let note = format!("deadline {}", deadline.to_rfc3339());
        repository::append_history(
            &tx,
            &alert_id,
            &NewHistoryEntry {
                event,
                from_state: Some(from_state),
                to_state: AlertState::Escalated,
                tier_index: to_tier,
                actor: SCHEDULER_ACTOR,
                note: Some(&note),
                at: now,
            },
        )?;
        let updated = repository::get_alert(&tx, &alert_id)?
            .ok_or(TriageError::AlertNotFound(alert_id))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Hand an open alert to another responder.
    pub fn reassign(&self, alert_id: Uuid, actor: &str, assignee: &str) -> Result<Alert, TriageError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = repository::get_alert(&tx, &alert_id)?
            .ok_or(TriageError::AlertNotFound(alert_id))?;
        if !repository::set_assignee(&tx, &alert_id, assignee, now)? {
            return Err(TriageError::AlertClosed {
                alert_id,
                state: current.state,
            });
        }
        let note = format!("assigned to {assignee}");
        repository::append_history(
            &tx,
            &alert_id,
            &NewHistoryEntry {
                event: HistoryEvent::Reassigned,
                from_state: Some(current.state),
                to_state: current.state,
                tier_index: current.current_tier_index,
                actor,
                note: Some(&note),
                at: now,
            },
        )?;
        let updated = repository::get_alert(&tx, &alert_id)?
            .ok_or(TriageError::AlertNotFound(alert_id))?;
        tx.commit()?;
        Ok(updated)
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn get(&self, alert_id: Uuid) -> Result<Alert, TriageError> {
        let conn = self.lock()?;
        repository::get_alert(&conn, &alert_id)?.ok_or(TriageError::AlertNotFound(alert_id))
    }

    pub fn open_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Alert>, TriageError> {
        let conn = self.lock()?;
        Ok(repository::get_open_alert_by_fingerprint(&conn, fingerprint)?)
    }

    pub fn history(&self, alert_id: Uuid) -> Result<Vec<TransitionRecord>, TriageError> {
        let conn = self.lock()?;
        if repository::get_alert(&conn, &alert_id)?.is_none() {
            return Err(TriageError::AlertNotFound(alert_id));
        }
        Ok(repository::list_history(&conn, &alert_id)?)
    }

    pub fn list_open(&self, filter: &AlertFilter) -> Result<Vec<Alert>, TriageError> {
        let conn = self.lock()?;
        Ok(repository::list_open_alerts(&conn, filter)?)
    }

    /// Alerts whose SLA clock is running, for timer recovery.
    pub fn list_schedulable(&self) -> Result<Vec<Alert>, TriageError> {
        let conn = self.lock()?;
        Ok(repository::list_schedulable_alerts(&conn)?)
    }

    // ── Notification attempts ───────────────────────────────

    pub fn begin_attempt(
        &self,
        alert_id: Uuid,
        tier_index: u32,
        channel: ChannelKind,
        attempt_number: u32,
    ) -> Result<NotificationAttempt, TriageError> {
        let attempt = NotificationAttempt {
            id: Uuid::new_v4(),
            alert_id,
            tier_index,
            channel,
            attempt_number,
            sent_at: self.clock.now(),
            outcome: DeliveryOutcome::Pending,
            detail: None,
        };
        let conn = self.lock()?;
        repository::insert_attempt(&conn, &attempt)?;
        Ok(attempt)
    }

    /// Write the outcome of a pending attempt. Completed attempts are never
    /// rewritten; a second completion is a constraint violation.
    pub fn complete_attempt(
        &self,
        mut attempt: NotificationAttempt,
        outcome: DeliveryOutcome,
        detail: Option<String>,
    ) -> Result<NotificationAttempt, TriageError> {
        let now = self.clock.now();
        let conn = self.lock()?;
        if !repository::complete_attempt(&conn, &attempt.id, outcome, detail.as_deref(), now)? {
            return Err(DatabaseError::ConstraintViolation(format!(
                "attempt {} already completed",
                attempt.id
            ))
            .into());
        }
        attempt.outcome = outcome;
        attempt.detail = detail;
        Ok(attempt)
    }

    pub fn attempts_for(&self, alert_id: Uuid) -> Result<Vec<NotificationAttempt>, TriageError> {
        let conn = self.lock()?;
        Ok(repository::list_attempts(&conn, &alert_id)?)
    }

    // ── Rule state and signal log ───────────────────────────

    /// Read-modify-write one rolling-state slot in a single transaction.
    /// The state is only saved when `f` succeeds.
    pub fn with_rolling_state<T>(
        &self,
        key: &RollingStateKey,
        f: impl FnOnce(&mut RollingState) -> Result<T, EvaluationError>,
    ) -> Result<T, TriageError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = repository::load_rolling_state(&tx, key)?;
        let value = f(&mut state)?;
        repository::save_rolling_state(&tx, key, &state, now)?;
        tx.commit()?;
        Ok(value)
    }

    /// Log a signal as processed. False means it was seen before.
    pub fn record_signal(&self, signal: &Signal) -> Result<bool, TriageError> {
        let now = self.clock.now();
        let conn = self.lock()?;
        Ok(repository::record_processed_signal(&conn, signal, now)?)
    }

    /// Undo `record_signal` so a resubmission of the signal is evaluated.
    pub fn forget_signal(&self, signal: &Signal) -> Result<(), TriageError> {
        let conn = self.lock()?;
        repository::forget_processed_signal(&conn, &signal.fingerprint)?;
        Ok(())
    }

    /// Drop signal log entries received before `cutoff`.
    pub fn prune_signal_log(&self, cutoff: DateTime<Utc>) -> Result<usize, TriageError> {
        let conn = self.lock()?;
        Ok(repository::prune_processed_signals(&conn, cutoff)?)
    }

    #[cfg(test)]
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&conn)
    }
}
