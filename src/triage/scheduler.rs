//! Escalation scheduler: one SLA timer per alert awaiting acknowledgment.
//!
//! Timers live in an arena keyed by alert id. Every arm bumps a generation
//! counter so a stale cancel can never remove a newer timer. Expiries are
//! handled on the blocking pool (critical first) and each one re-checks the
//! alert through the store's compare-and-set, so a concurrent acknowledgment
//! or cancellation always wins cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use super::clock::Clock;
use super::dispatcher::{DispatchJob, DispatchReason, Dispatcher};
use super::error::TriageError;
use super::events::{EngineEvent, EventBus};
use super::rules::RuleRegistry;
use super::store::AlertStore;
use crate::models::enums::Severity;

/// Longest the driver sleeps without re-reading the wall clock.
const MAX_IDLE: StdDuration = StdDuration::from_secs(30);

/// Retry delay after a storage failure while escalating.
const STORE_RETRY_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub alert_id: Uuid,
    pub tier_index: u32,
    pub deadline: DateTime<Utc>,
    pub severity: Severity,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Moved to the next tier and notified it.
    Escalated { alert_id: Uuid, tier_index: u32 },
    /// Final tier re-notified and re-armed.
    Repeated { alert_id: Uuid, tier_index: u32 },
    /// Nothing to do: the alert moved on before the timer fired.
    Discarded { alert_id: Uuid, reason: &'static str },
    /// Storage failed; the timer was re-armed for a retry.
    Deferred { alert_id: Uuid },
}

pub struct EscalationScheduler {
    store: Arc<AlertStore>,
    rules: Arc<RuleRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    timers: Mutex<HashMap<Uuid, TimerEntry>>,
    generation: AtomicU64,
    wake: Notify,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<AlertStore>,
        rules: Arc<RuleRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            rules,
            dispatcher,
            events,
            clock,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<Uuid, TimerEntry>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Arena ───────────────────────────────────────────────

    /// Arm (or replace) the timer for an alert. Returns its generation.
    pub fn arm(
        &self,
        alert_id: Uuid,
        tier_index: u32,
        deadline: DateTime<Utc>,
        severity: Severity,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.timers().insert(
            alert_id,
            TimerEntry {
                alert_id,
                tier_index,
                deadline,
                severity,
                generation,
            },
        );
        tracing::debug!(alert_id = %alert_id, tier = tier_index, deadline = %deadline, "SLA timer armed");
        self.wake.notify_one();
        generation
    }

    /// Arm, then confirm the alert is still waiting at that tier. If it was
    /// acknowledged or closed in between, the fresh timer is removed again.
    pub fn arm_verified(
        &self,
        alert_id: Uuid,
        tier_index: u32,
        deadline: DateTime<Utc>,
        severity: Severity,
    ) -> Result<bool, TriageError> {
        let generation = self.arm(alert_id, tier_index, deadline, severity);
        let alert = self.store.get(alert_id)?;
        if alert.state.awaits_acknowledgment() && alert.current_tier_index == tier_index {
            Ok(true)
        } else {
            self.cancel_generation(alert_id, generation);
            Ok(false)
        }
    }

    pub fn cancel(&self, alert_id: Uuid) -> bool {
        let removed = self.timers().remove(&alert_id).is_some();
        if removed {
            tracing::debug!(alert_id = %alert_id, "SLA timer cancelled");
        }
        removed
    }

    /// Remove the timer only if it is still the one armed as `generation`.
    fn cancel_generation(&self, alert_id: Uuid, generation: u64) -> bool {
        let mut timers = self.timers();
        match timers.get(&alert_id) {
            Some(entry) if entry.generation == generation => {
                timers.remove(&alert_id);
                true
            }
            _ => false,
        }
    }

    pub fn armed(&self, alert_id: Uuid) -> Option<TimerEntry> {
        self.timers().get(&alert_id).copied()
    }

    pub fn armed_count(&self) -> usize {
        self.timers().len()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers().values().map(|t| t.deadline).min()
    }

    /// Remove and return every due timer, most severe first, then earliest.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<TimerEntry> {
        let mut timers = self.timers();
        let due_ids: Vec<Uuid> = timers
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.alert_id)
            .collect();
        let mut due: Vec<TimerEntry> = due_ids
            .iter()
            .filter_map(|id| timers.remove(id))
            .collect();
        due.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.deadline.cmp(&b.deadline))
        });
        due
    }

    // ── Expiry ──────────────────────────────────────────────

    /// Handle every timer that is due now. Each expiry runs as its own
    /// blocking task; they are started critical first.
    pub async fn fire_due(self: &Arc<Self>) -> Vec<ExpiryOutcome> {
        let due = self.take_due(self.clock.now());
        if due.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = due.len(), "SLA timers expired");

        let handles: Vec<_> = due
            .into_iter()
            .map(|entry| {
                let scheduler = Arc::clone(self);
                let handle = tokio::task::spawn_blocking(move || scheduler.handle_expiry(entry));
                (entry.alert_id, handle)
            })
            .collect();

        let ids: Vec<Uuid> = handles.iter().map(|(id, _)| *id).collect();
        let results = join_all(handles.into_iter().map(|(_, h)| h)).await;
        ids.into_iter()
            .zip(results)
            .map(|(alert_id, result)| {
                result.unwrap_or_else(|e| {
                    tracing::error!(alert_id = %alert_id, error = %e, "Expiry handler panicked");
                    ExpiryOutcome::Discarded {
                        alert_id,
                        reason: "expiry handler panicked",
                    }
                })
            })
            .collect()
    }

    /// Advance one expired alert: next tier, or repeat at the final tier.
    pub fn handle_expiry(&self, entry: TimerEntry) -> ExpiryOutcome {
        let alert_id = entry.alert_id;
        let alert = match self.store.get(alert_id) {
            Ok(alert) => alert,
            Err(TriageError::AlertNotFound(_)) => {
                return ExpiryOutcome::Discarded {
                    alert_id,
                    reason: "alert not found",
                }
            }
            Err(e) => return self.defer(entry, &e),
        };
        if !alert.state.awaits_acknowledgment() {
            return ExpiryOutcome::Discarded {
                alert_id,
                reason: "alert no longer awaiting acknowledgment",
            };
        }
        if alert.current_tier_index != entry.tier_index {
            return ExpiryOutcome::Discarded {
                alert_id,
                reason: "tier already advanced",
            };
        }

        let now = self.clock.now();
        let rules = self.rules.current();
        let from_tier = alert.current_tier_index;
        let (to_tier, interval) = match rules.rule(&alert.rule_id) {
            Some(rule) if from_tier < rule.last_tier_index() => {
                let next = from_tier + 1;
                let sla = rule.tier(next).map(|t| t.sla()).unwrap_or_else(|| {
                    rule.repeat_interval(rules.default_repeat_minutes)
                });
                (next, sla)
            }
            Some(rule) => (from_tier, rule.repeat_interval(rules.default_repeat_minutes)),
            None => {
                tracing::error!(
                    alert_id = %alert_id,
                    rule_id = %alert.rule_id,
                    "Rule no longer configured; repeating current tier"
                );
                (from_tier, Duration::minutes(i64::from(rules.default_repeat_minutes)))
            }
        };
        let deadline = now + interval;

        match self
            .store
            .escalate(alert_id, alert.state, from_tier, to_tier, deadline)
        {
            Ok(_) => {}
            Err(TriageError::InvalidTransition { current, .. }) => {
                tracing::debug!(alert_id = %alert_id, state = %current, "Expiry lost race, discarding");
                return ExpiryOutcome::Discarded {
                    alert_id,
                    reason: "state changed concurrently",
                };
            }
            Err(e) => return self.defer(entry, &e),
        }

        match self.arm_verified(alert_id, to_tier, deadline, alert.severity) {
            Ok(true) => {}
            Ok(false) => {
                return ExpiryOutcome::Discarded {
                    alert_id,
                    reason: "answered while escalating",
                }
            }
            Err(e) => {
                // The escalation is committed and the timer stays armed.
                tracing::warn!(alert_id = %alert_id, error = %e, "Could not re-verify alert after escalation");
            }
        }

        let repeat = to_tier == from_tier;
        self.dispatcher.enqueue(DispatchJob {
            alert_id,
            tier_index: to_tier,
            severity: alert.severity,
            reason: if repeat {
                DispatchReason::FinalTierRepeat
            } else {
                DispatchReason::Escalation
            },
        });

        let overdue_ms = (now - entry.deadline).num_milliseconds();
        if repeat {
            tracing::warn!(
                alert_id = %alert_id,
                tier = to_tier,
                severity = %alert.severity,
                overdue_ms,
                "Final tier unacknowledged, notifying again"
            );
            self.events.publish(EngineEvent::Repeated {
                alert_id,
                tier_index: to_tier,
            });
            ExpiryOutcome::Repeated {
                alert_id,
                tier_index: to_tier,
            }
        } else {
            tracing::warn!(
                alert_id = %alert_id,
                from_tier,
                to_tier,
                severity = %alert.severity,
                overdue_ms,
                "SLA breached, escalating"
            );
            self.events.publish(EngineEvent::Escalated {
                alert_id,
                tier_index: to_tier,
            });
            ExpiryOutcome::Escalated {
                alert_id,
                tier_index: to_tier,
            }
        }
    }

    /// Storage trouble must not silently stop an escalation: try again soon.
    fn defer(&self, entry: TimerEntry, error: &TriageError) -> ExpiryOutcome {
        let retry_at = self.clock.now() + Duration::seconds(STORE_RETRY_SECS);
        tracing::error!(alert_id = %entry.alert_id, error = %error, retry_at = %retry_at, "Escalation deferred");
        self.arm(entry.alert_id, entry.tier_index, retry_at, entry.severity);
        ExpiryOutcome::Deferred {
            alert_id: entry.alert_id,
        }
    }

    // ── Recovery & driver ───────────────────────────────────

    /// Rebuild the arena from stored deadlines. Overdue timers fire on the
    /// next driver tick.
    pub fn recover(&self) -> Result<usize, TriageError> {
        let alerts = self.store.list_schedulable()?;
        let now = self.clock.now();
        let mut overdue = 0;
        for alert in &alerts {
            if let Some(deadline) = alert.tier_deadline {
                if deadline <= now {
                    overdue += 1;
                }
                self.arm(alert.id, alert.current_tier_index, deadline, alert.severity);
            }
        }
        tracing::info!(armed = alerts.len(), overdue, "SLA timers recovered");
        Ok(alerts.len())
    }

    /// Sleep until the earliest deadline (or an arm), fire, repeat. Sleeps
    /// on tokio's monotonic timer but re-reads the wall clock on each wake.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Escalation scheduler started");
        let mut last_seen = self.clock.now();
        loop {
            let now = self.clock.now();
            if now < last_seen {
                tracing::warn!(
                    jump_ms = (last_seen - now).num_milliseconds(),
                    "Wall clock moved backwards; pending escalations wait for it to catch up"
                );
            }
            last_seen = now;

            let wait = match self.next_deadline() {
                Some(deadline) if deadline <= now => StdDuration::ZERO,
                Some(deadline) => (deadline - now).to_std().unwrap_or(MAX_IDLE).min(MAX_IDLE),
                None => MAX_IDLE,
            };

            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.fire_due().await;
        }
        tracing::info!("Escalation scheduler stopped");
    }
}
