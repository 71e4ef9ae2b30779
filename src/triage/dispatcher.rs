//! Notification dispatch: a severity-ordered job queue drained by a pool of
//! workers, each job walking a tier's channel list with bounded retries.
//!
//! Delivery failures never touch the SLA clock. If every channel of a tier
//! is exhausted the alert keeps its deadline and the scheduler escalates on
//! time regardless.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::TriageError;
use super::events::{EngineEvent, EventBus};
use super::rules::RuleRegistry;
use super::store::AlertStore;
use crate::channels::{ChannelError, ChannelRegistry, NotificationMessage};
use crate::models::enums::{DeliveryOutcome, Severity};
use crate::models::{Alert, NotificationAttempt};

/// Why a notification is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchReason {
    Initial,
    Escalation,
    FinalTierRepeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchJob {
    pub alert_id: Uuid,
    pub tier_index: u32,
    pub severity: Severity,
    pub reason: DispatchReason,
}

// ═══════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════

#[derive(Debug, PartialEq, Eq)]
struct QueuedJob {
    job: DispatchJob,
    seq: u64,
}

impl Ord for QueuedJob {
    // Max-heap: higher severity first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .severity
            .cmp(&other.job.severity)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending notifications. Critical work is always taken
/// before lower severities, however much of it is waiting.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    seq: AtomicU64,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: DispatchJob) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(QueuedJob { job, seq });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<DispatchJob> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|q| q.job)
    }

    /// Wait for the highest-priority job.
    pub async fn pop(&self) -> DispatchJob {
        loop {
            if let Some(job) = self.try_pop() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════
// Retry policy
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts_per_channel: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be randomly shaved off, in [0, 1].
    pub jitter: f64,
    pub send_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_channel: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `min(base * 2^(attempt-1), max)`
    /// minus up to `jitter` of itself.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let shave = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 - shave)
    }
}

// ═══════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════

/// Everything that happened while notifying one tier.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub alert_id: Uuid,
    pub tier_index: u32,
    pub attempts: Vec<NotificationAttempt>,
    pub delivered: bool,
}

impl DispatchReport {
    fn new(alert_id: Uuid, tier_index: u32) -> Self {
        Self {
            alert_id,
            tier_index,
            attempts: Vec::new(),
            delivered: false,
        }
    }

    pub fn last_attempt(&self) -> Option<&NotificationAttempt> {
        self.attempts.last()
    }
}

pub struct Dispatcher {
    store: Arc<AlertStore>,
    rules: Arc<RuleRegistry>,
    channels: ChannelRegistry,
    policy: RetryPolicy,
    queue: Arc<DispatchQueue>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        store: Arc<AlertStore>,
        rules: Arc<RuleRegistry>,
        channels: ChannelRegistry,
        policy: RetryPolicy,
        queue: Arc<DispatchQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            rules,
            channels,
            policy,
            queue,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn enqueue(&self, job: DispatchJob) {
        tracing::debug!(
            alert_id = %job.alert_id,
            tier = job.tier_index,
            severity = %job.severity,
            reason = ?job.reason,
            "Notification queued"
        );
        self.queue.enqueue(job);
    }

    /// Run one queued job. Jobs for alerts that no longer await an
    /// acknowledgment are dropped without sending.
    pub async fn process_job(&self, job: DispatchJob) -> Result<Option<DispatchReport>, TriageError> {
        let alert = self.store.get(job.alert_id)?;
        if !alert.state.awaits_acknowledgment() {
            tracing::debug!(
                alert_id = %alert.id,
                state = %alert.state,
                "Skipping notification for alert no longer awaiting acknowledgment"
            );
            return Ok(None);
        }
        self.dispatch(&alert, job.tier_index).await.map(Some)
    }

    /// Notify one tier: channels in order, each retried with backoff, until
    /// one delivers.
    pub async fn dispatch(&self, alert: &Alert, tier_index: u32) -> Result<DispatchReport, TriageError> {
        let mut report = DispatchReport::new(alert.id, tier_index);
        let rules = self.rules.current();
        let Some(tier) = rules
            .rule(&alert.rule_id)
            .and_then(|rule| rule.tier(tier_index))
            .cloned()
        else {
            tracing::error!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                tier = tier_index,
                "No escalation tier configured for alert, cannot notify"
            );
            self.report_exhausted(&report);
            return Ok(report);
        };
        let message = NotificationMessage::for_alert(alert, &tier, tier_index);

        for kind in &tier.channels {
            let Some(channel) = self.channels.get(*kind) else {
                tracing::warn!(alert_id = %alert.id, channel = %kind, "No provider registered for channel");
                continue;
            };

            for attempt_number in 1..=self.policy.max_attempts_per_channel {
                if attempt_number > 1 && !self.still_awaiting(alert.id)? {
                    tracing::debug!(alert_id = %alert.id, "Alert answered during retries, stopping");
                    return Ok(report);
                }

                let attempt = self
                    .store
                    .begin_attempt(alert.id, tier_index, *kind, attempt_number)?;
                let sent = tokio::time::timeout(
                    self.policy.send_timeout,
                    channel.send(&alert.subject_id, &tier, &message),
                )
                .await;
                let (outcome, detail) = match sent {
                    Ok(Ok(())) => (DeliveryOutcome::Delivered, None),
                    Ok(Err(ChannelError::TimedOut)) | Err(_) => {
                        (DeliveryOutcome::TimedOut, Some("send timed out".to_string()))
                    }
                    Ok(Err(e)) => (DeliveryOutcome::Failed, Some(e.to_string())),
                };
                let attempt = self.store.complete_attempt(attempt, outcome, detail)?;
                report.attempts.push(attempt);

                if outcome == DeliveryOutcome::Delivered {
                    tracing::info!(
                        alert_id = %alert.id,
                        tier = tier_index,
                        channel = %kind,
                        attempt = attempt_number,
                        "Notification delivered"
                    );
                    report.delivered = true;
                    return Ok(report);
                }

                tracing::warn!(
                    alert_id = %alert.id,
                    channel = %kind,
                    attempt = attempt_number,
                    outcome = %outcome,
                    "Notification attempt failed"
                );
                if attempt_number < self.policy.max_attempts_per_channel {
                    tokio::time::sleep(self.policy.backoff_delay(attempt_number)).await;
                }
            }
        }

        self.report_exhausted(&report);
        Ok(report)
    }

    fn still_awaiting(&self, alert_id: Uuid) -> Result<bool, TriageError> {
        Ok(self.store.get(alert_id)?.state.awaits_acknowledgment())
    }

    fn report_exhausted(&self, report: &DispatchReport) {
        tracing::warn!(
            alert_id = %report.alert_id,
            tier = report.tier_index,
            attempts = report.attempts.len(),
            "All notification channels exhausted; SLA clock keeps running"
        );
        self.events.publish(EngineEvent::DispatchExhausted {
            alert_id: report.alert_id,
            tier_index: report.tier_index,
            attempts: report.attempts.len(),
        });
    }

    /// Process everything currently queued, in priority order.
    pub async fn drain(&self) -> Vec<DispatchReport> {
        let mut reports = Vec::new();
        while let Some(job) = self.queue.try_pop() {
            match self.process_job(job).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Dispatch job failed"),
            }
        }
        reports
    }

    /// Start `count` workers pulling from the queue until shutdown.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Dispatch worker started");
                    loop {
                        tokio::select! {
                            job = dispatcher.queue.pop() => {
                                let alert_id = job.alert_id;
                                if let Err(e) = dispatcher.process_job(job).await {
                                    tracing::error!(worker, alert_id = %alert_id, error = %e, "Dispatch job failed");
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                    tracing::debug!(worker, "Dispatch worker stopped");
                })
            })
            .collect()
    }
}
