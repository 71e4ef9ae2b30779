//! Triage engine: wires intake, evaluation, the store, the scheduler and the
//! dispatcher together, and owns the background workers.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::clock::Clock;
use super::dispatcher::{DispatchJob, DispatchQueue, DispatchReason, Dispatcher, RetryPolicy};
use super::error::TriageError;
use super::evaluator::{evaluate_rule, fingerprint_for, scope_key, RuleOutcome};
use super::events::{EngineEvent, EventBus};
use super::intake::{normalize, IntakeError, SignalSubmission};
use super::response::ResponseTracker;
use super::rules::{AlertRule, RuleRegistry};
use super::scheduler::EscalationScheduler;
use super::store::AlertStore;
use crate::channels::ChannelRegistry;
use crate::db::repository::RollingStateKey;
use crate::models::enums::Severity;
use crate::models::{AlertTrigger, Signal};

/// Actor recorded when an alert is cancelled because its condition cleared.
pub const RECOVERY_ACTOR: &str = "system:recovery";

/// How long a processed signal is remembered for replay detection.
pub const DEFAULT_REPLAY_WINDOW_DAYS: i64 = 7;

const SIGNAL_LOG_PRUNE_EVERY: StdDuration = StdDuration::from_secs(3600);

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Malformed signal: {0}")]
    Malformed(#[from] IntakeError),

    #[error(transparent)]
    Triage(#[from] TriageError),
}

/// What one rule made of a signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RuleDecision {
    Quiet {
        rule_id: String,
    },
    Created {
        rule_id: String,
        alert_id: Uuid,
        severity: Severity,
    },
    /// Folded into the alert already open for the same condition.
    Merged {
        rule_id: String,
        alert_id: Uuid,
    },
    Recovered {
        rule_id: String,
        cancelled_alert: Option<Uuid>,
    },
    Dropped {
        rule_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeReport {
    pub signal_id: Uuid,
    /// The same signal was processed before; nothing was evaluated.
    pub duplicate: bool,
    pub decisions: Vec<RuleDecision>,
}

impl IntakeReport {
    /// Ids of alerts this signal opened.
    pub fn created(&self) -> Vec<Uuid> {
        self.decisions
            .iter()
            .filter_map(|d| match d {
                RuleDecision::Created { alert_id, .. } => Some(*alert_id),
                _ => None,
            })
            .collect()
    }
}

pub struct TriageEngine {
    store: Arc<AlertStore>,
    rules: Arc<RuleRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<EscalationScheduler>,
    tracker: ResponseTracker,
    events: EventBus,
    replay_window: Duration,
}

impl TriageEngine {
    pub fn new(
        store: Arc<AlertStore>,
        rules: Arc<RuleRegistry>,
        channels: ChannelRegistry,
        policy: RetryPolicy,
    ) -> Self {
        let clock = Arc::clone(store.clock());
        let events = EventBus::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&rules),
            channels,
            policy,
            Arc::new(DispatchQueue::new()),
            events.clone(),
        ));
        let scheduler = Arc::new(EscalationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&rules),
            Arc::clone(&dispatcher),
            events.clone(),
            clock,
        ));
        let tracker = ResponseTracker::new(Arc::clone(&store), Arc::clone(&scheduler), events.clone());
        Self {
            store,
            rules,
            dispatcher,
            scheduler,
            tracker,
            events,
            replay_window: Duration::days(DEFAULT_REPLAY_WINDOW_DAYS),
        }
    }

    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }

    pub fn store(&self) -> &Arc<AlertStore> {
        &self.store
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<EscalationScheduler> {
        &self.scheduler
    }

    pub fn responses(&self) -> &ResponseTracker {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.store.clock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════
    // Intake
    // ═══════════════════════════════════════════════════════════

    /// Validate, evaluate and act on one submission.
    pub fn submit(&self, submission: &SignalSubmission) -> Result<IntakeReport, SubmitError> {
        let signal = match normalize(submission) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(
                    subject_id = %submission.subject_id,
                    kind = %submission.kind,
                    error = %e,
                    "Dropping malformed signal"
                );
                self.events.publish(EngineEvent::SignalDropped {
                    subject_id: submission.subject_id.clone(),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        Ok(self.process_signal(&signal)?)
    }

    /// Run a normalized signal through every rule it feeds.
    pub fn process_signal(&self, signal: &Signal) -> Result<IntakeReport, TriageError> {
        if !self.store.record_signal(signal)? {
            tracing::debug!(signal_id = %signal.id, kind = %signal.kind, "Replayed signal ignored");
            return Ok(IntakeReport {
                signal_id: signal.id,
                duplicate: true,
                decisions: Vec::new(),
            });
        }

        let rules = self.rules.current();
        let mut decisions = Vec::new();
        for rule in rules.rules_for(signal.kind) {
            let decision = match self.evaluate_one(rule, signal) {
                Ok(decision) => decision,
                Err(TriageError::Evaluation(e)) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        signal_id = %signal.id,
                        error = %e,
                        "Rule could not evaluate signal, dropping it for this rule"
                    );
                    self.events.publish(EngineEvent::SignalDropped {
                        subject_id: signal.subject_id.clone(),
                        reason: e.to_string(),
                    });
                    RuleDecision::Dropped {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    self.release_signal(signal);
                    return Err(e);
                }
            };
            decisions.push(decision);
        }

        Ok(IntakeReport {
            signal_id: signal.id,
            duplicate: false,
            decisions,
        })
    }

    /// Let a resubmission of `signal` through after processing failed.
    fn release_signal(&self, signal: &Signal) {
        if let Err(e) = self.store.forget_signal(signal) {
            tracing::error!(signal_id = %signal.id, error = %e, "Cannot release failed signal for retry");
        }
    }

    /// Forget processed signals older than the replay window.
    pub fn prune_signal_log(&self) -> Result<usize, TriageError> {
        let cutoff = self.clock().now() - self.replay_window;
        let removed = self.store.prune_signal_log(cutoff)?;
        if removed > 0 {
            tracing::debug!(removed, cutoff = %cutoff, "Pruned signal log");
        }
        Ok(removed)
    }

    fn evaluate_one(&self, rule: &AlertRule, signal: &Signal) -> Result<RuleDecision, TriageError> {
        let key = RollingStateKey {
            subject_id: signal.subject_id.clone(),
            rule_id: rule.id.clone(),
            scope_key: scope_key(rule, signal)?,
        };
        // Once the alert for a tripped condition is closed, a condition that
        // still holds must be able to raise a new one.
        let alert_open = self
            .store
            .open_by_fingerprint(&fingerprint_for(rule, signal)?)?
            .is_some();
        let outcome = self.store.with_rolling_state(&key, |state| {
            if !alert_open {
                state.rearm();
            }
            evaluate_rule(rule, signal, state)
        })?;

        match outcome {
            RuleOutcome::Trigger(trigger) => self.open_alert(rule, &trigger),
            RuleOutcome::Recovered { fingerprint } => self.recover_condition(rule, &fingerprint),
            RuleOutcome::Quiet => Ok(RuleDecision::Quiet {
                rule_id: rule.id.clone(),
            }),
        }
    }

    fn open_alert(&self, rule: &AlertRule, trigger: &AlertTrigger) -> Result<RuleDecision, TriageError> {
        let Some(first_tier) = rule.tier(0) else {
            return Ok(RuleDecision::Dropped {
                rule_id: rule.id.clone(),
                reason: "rule has no escalation tiers".into(),
            });
        };
        let deadline = self.clock().now() + first_tier.sla();
        let (alert, created) = self.store.create_or_merge(trigger, deadline)?;

        if !created {
            tracing::debug!(
                alert_id = %alert.id,
                fingerprint = %trigger.fingerprint,
                "Trigger folded into open alert"
            );
            self.events.publish(EngineEvent::AlertMerged {
                alert_id: alert.id,
                signal_id: trigger.signal_id,
            });
            return Ok(RuleDecision::Merged {
                rule_id: rule.id.clone(),
                alert_id: alert.id,
            });
        }

        tracing::info!(
            alert_id = %alert.id,
            rule_id = %rule.id,
            subject_id = %alert.subject_id,
            severity = %alert.severity,
            deadline = %deadline,
            "Alert opened"
        );
        if self.scheduler.arm_verified(alert.id, 0, deadline, alert.severity)? {
            self.dispatcher.enqueue(DispatchJob {
                alert_id: alert.id,
                tier_index: 0,
                severity: alert.severity,
                reason: DispatchReason::Initial,
            });
        }
        self.events.publish(EngineEvent::AlertCreated {
            alert_id: alert.id,
            rule_id: rule.id.clone(),
            subject_id: alert.subject_id.clone(),
            severity: alert.severity,
        });
        Ok(RuleDecision::Created {
            rule_id: rule.id.clone(),
            alert_id: alert.id,
            severity: alert.severity,
        })
    }

    fn recover_condition(&self, rule: &AlertRule, fingerprint: &str) -> Result<RuleDecision, TriageError> {
        let mut cancelled_alert = None;
        if rule.auto_cancel_on_recovery {
            if let Some(open) = self.store.open_by_fingerprint(fingerprint)? {
                match self
                    .tracker
                    .cancel_as(open.id, RECOVERY_ACTOR, "condition recovered")
                {
                    Ok(_) => cancelled_alert = Some(open.id),
                    Err(TriageError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::debug!(rule_id = %rule.id, fingerprint, cancelled = cancelled_alert.is_some(), "Condition recovered");
        Ok(RuleDecision::Recovered {
            rule_id: rule.id.clone(),
            cancelled_alert,
        })
    }

    // ═══════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════

    /// Re-arm SLA timers for alerts persisted before a restart.
    pub fn recover(&self) -> Result<usize, TriageError> {
        self.scheduler.recover()
    }

    /// Start the scheduler driver, `dispatch_workers` dispatch workers and an
    /// intake worker fed by a bounded queue.
    pub fn spawn_workers(
        self: &Arc<Self>,
        dispatch_workers: usize,
        intake_capacity: usize,
    ) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (intake_tx, intake_rx) = mpsc::channel(intake_capacity.max(1));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(shutdown_rx.clone()),
        ));
        tasks.extend(
            self.dispatcher
                .spawn_workers(dispatch_workers, shutdown_rx.clone()),
        );
        tasks.push(self.spawn_intake(intake_rx, shutdown_rx.clone()));
        tasks.push(self.spawn_housekeeping(shutdown_rx));
        tracing::info!(dispatch_workers, "Engine workers started");

        EngineHandle {
            shutdown: shutdown_tx,
            intake: intake_tx,
            tasks,
        }
    }

    fn spawn_housekeeping(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SIGNAL_LOG_PRUNE_EVERY);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let worker = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || worker.prune_signal_log()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Signal log pruning failed"),
                    Err(e) => tracing::error!(error = %e, "Housekeeping task panicked"),
                }
            }
            tracing::debug!("Housekeeping worker stopped");
        })
    }

    fn spawn_intake(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<SignalSubmission>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let submission = tokio::select! {
                    next = rx.recv() => match next {
                        Some(submission) => submission,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                let worker = Arc::clone(&engine);
                let result =
                    tokio::task::spawn_blocking(move || worker.submit(&submission)).await;
                match result {
                    Ok(Ok(report)) => {
                        tracing::debug!(signal_id = %report.signal_id, decisions = report.decisions.len(), "Signal processed")
                    }
                    // Malformed signals were already logged and dropped.
                    Ok(Err(SubmitError::Malformed(_))) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Signal processing failed"),
                    Err(e) => tracing::error!(error = %e, "Intake task panicked"),
                }
            }
            tracing::debug!("Intake worker stopped");
        })
    }
}

/// Running background workers. Dropping the handle signals shutdown.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    intake: mpsc::Sender<SignalSubmission>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Asynchronous intake queue.
    pub fn intake(&self) -> mpsc::Sender<SignalSubmission> {
        self.intake.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for every worker to finish its current job.
    pub async fn join(mut self) {
        self.shutdown();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Engine worker ended abnormally");
            }
        }
        tracing::info!("Engine workers stopped");
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::channels::testing::ScriptedChannel;
    use crate::models::enums::{AlertState, ChannelKind};
    use crate::models::AlertFilter;
    use crate::triage::clock::ManualClock;
    use crate::triage::rules::tests::missed_dose_rule;
    use crate::triage::rules::RuleSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 4, 6, 0, 0).unwrap()
    }

    fn engine_with(rules: Vec<AlertRule>) -> (Arc<TriageEngine>, Arc<ManualClock>, Arc<ScriptedChannel>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(AlertStore::open_in_memory(clock.clone()).unwrap());
        let registry = Arc::new(
            RuleRegistry::new(RuleSet {
                version: 1,
                default_repeat_minutes: 15,
                rules,
            })
            .unwrap(),
        );
        let push = Arc::new(ScriptedChannel::always_ok(ChannelKind::Push));
        let channels = ChannelRegistry::new()
            .with(push.clone())
            .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Sms)));
        let engine = TriageEngine::new(store, registry, channels, RetryPolicy::default());
        (Arc::new(engine), clock, push)
    }

    fn miss(rx: &str, at: DateTime<Utc>) -> SignalSubmission {
        SignalSubmission {
            kind: "adherence_miss".into(),
            subject_id: "patient-6".into(),
            occurred_at: at,
            payload: json!({ "prescription_id": rx }),
            subject_risk: None,
        }
    }

    fn taken(rx: &str, at: DateTime<Utc>) -> SignalSubmission {
        SignalSubmission {
            kind: "dose_taken".into(),
            subject_id: "patient-6".into(),
            occurred_at: at,
            payload: json!({ "prescription_id": rx }),
            subject_risk: None,
        }
    }

    #[test]
    fn trigger_opens_alert_arms_timer_and_queues_tier_zero() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(1)]);
        let report = engine.submit(&miss("rx-1", t0())).unwrap();
        let ids = report.created();
        assert_eq!(ids.len(), 1);

        let timer = engine.scheduler().armed(ids[0]).unwrap();
        assert_eq!(timer.deadline, t0() + Duration::minutes(30));
        let job = engine.dispatcher().queue().try_pop().unwrap();
        assert_eq!((job.alert_id, job.tier_index), (ids[0], 0));
    }

    #[test]
    fn replayed_signal_is_ignored() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(2)]);
        let first = engine.submit(&miss("rx-1", t0())).unwrap();
        assert!(!first.duplicate);
        let replay = engine.submit(&miss("rx-1", t0())).unwrap();
        assert!(replay.duplicate);
        assert!(replay.decisions.is_empty());

        // The replay did not count as a second miss.
        assert!(engine.store().list_open(&AlertFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn open_alert_absorbs_later_triggers() {
        let mut rule = missed_dose_rule(1);
        rule.scope = crate::triage::rules::RuleScope::Subject;
        let (engine, _, _) = engine_with(vec![rule]);

        engine.submit(&miss("rx-1", t0())).unwrap();
        engine.submit(&taken("rx-1", t0() + Duration::hours(1))).unwrap();
        let report = engine
            .submit(&miss("rx-1", t0() + Duration::hours(2)))
            .unwrap();
        assert!(matches!(report.decisions[..], [RuleDecision::Merged { .. }]));
        assert_eq!(engine.store().list_open(&AlertFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn recovery_cancels_when_rule_opts_in() {
        let mut rule = missed_dose_rule(2);
        rule.auto_cancel_on_recovery = true;
        let (engine, _, _) = engine_with(vec![rule]);

        engine.submit(&miss("rx-1", t0())).unwrap();
        let alert_id = engine.submit(&miss("rx-1", t0() + Duration::hours(1))).unwrap().created()[0];
        let report = engine.submit(&taken("rx-1", t0() + Duration::hours(2))).unwrap();

        assert_eq!(
            report.decisions,
            vec![RuleDecision::Recovered {
                rule_id: "missed-doses".into(),
                cancelled_alert: Some(alert_id)
            }]
        );
        let alert = engine.store().get(alert_id).unwrap();
        assert_eq!(alert.state, AlertState::Cancelled);
        assert!(engine.scheduler().armed(alert_id).is_none());
        let last = engine.store().history(alert_id).unwrap().pop().unwrap();
        assert_eq!(last.actor, RECOVERY_ACTOR);
    }

    #[test]
    fn recovery_leaves_alert_open_by_default() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(1)]);
        let alert_id = engine.submit(&miss("rx-1", t0())).unwrap().created()[0];
        engine.submit(&taken("rx-1", t0() + Duration::hours(1))).unwrap();
        assert_eq!(engine.store().get(alert_id).unwrap().state, AlertState::Pending);
    }

    #[test]
    fn malformed_signal_is_dropped_with_event() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(1)]);
        let mut events = engine.subscribe();
        let mut bad = miss("rx-1", t0());
        bad.payload = json!({});

        assert!(matches!(engine.submit(&bad), Err(SubmitError::Malformed(_))));
        assert!(matches!(events.try_recv().unwrap(), EngineEvent::SignalDropped { .. }));

        // Other signals still flow.
        assert_eq!(engine.submit(&miss("rx-2", t0())).unwrap().created().len(), 1);
    }

    #[test]
    fn condition_still_holding_after_resolve_raises_new_alert() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(3)]);
        for h in 0..2 {
            engine.submit(&miss("rx-1", t0() + Duration::hours(h))).unwrap();
        }
        let first = engine.submit(&miss("rx-1", t0() + Duration::hours(2))).unwrap().created()[0];
        engine.responses().acknowledge(first, "nurse-a").unwrap();
        engine.responses().resolve(first, "nurse-a", Some("called patient")).unwrap();

        let report = engine.submit(&miss("rx-1", t0() + Duration::hours(3))).unwrap();
        let second = report.created();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], first);

        // Further misses fold into the new alert.
        let report = engine.submit(&miss("rx-1", t0() + Duration::hours(4))).unwrap();
        assert!(matches!(report.decisions[..], [RuleDecision::Merged { alert_id, .. }] if alert_id == second[0]));
        assert_eq!(engine.store().list_open(&AlertFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn storage_failure_releases_signal_for_retry() {
        let (engine, _, _) = engine_with(vec![missed_dose_rule(1)]);
        engine.store().with_connection(|c| {
            c.execute_batch("ALTER TABLE rolling_state RENAME TO rolling_state_offline")
                .unwrap()
        });
        assert!(matches!(
            engine.submit(&miss("rx-1", t0())),
            Err(SubmitError::Triage(_))
        ));

        engine.store().with_connection(|c| {
            c.execute_batch("ALTER TABLE rolling_state_offline RENAME TO rolling_state")
                .unwrap()
        });
        let retry = engine.submit(&miss("rx-1", t0())).unwrap();
        assert!(!retry.duplicate);
        assert_eq!(retry.created().len(), 1);
    }

    #[test]
    fn signal_log_forgets_entries_outside_replay_window() {
        let (engine, clock, _) = engine_with(vec![missed_dose_rule(5)]);
        engine.submit(&miss("rx-1", t0())).unwrap();
        clock.advance(Duration::days(6));
        engine.submit(&miss("rx-1", t0() + Duration::days(6))).unwrap();

        clock.advance(Duration::days(2));
        assert_eq!(engine.prune_signal_log().unwrap(), 1);

        assert!(!engine.submit(&miss("rx-1", t0())).unwrap().duplicate);
        assert!(engine.submit(&miss("rx-1", t0() + Duration::days(6))).unwrap().duplicate);
    }

    #[test]
    fn replay_window_is_configurable() {
        let (engine, clock, _) = engine_with(vec![missed_dose_rule(5)]);
        let engine = Arc::try_unwrap(engine)
            .ok()
            .unwrap()
            .with_replay_window(Duration::days(30));
        engine.submit(&miss("rx-1", t0())).unwrap();
        clock.advance(Duration::days(8));
        assert_eq!(engine.prune_signal_log().unwrap(), 0);
        assert!(engine.submit(&miss("rx-1", t0())).unwrap().duplicate);
    }

    #[tokio::test]
    async fn workers_deliver_queued_intake() {
        let (engine, _, push) = engine_with(vec![missed_dose_rule(1)]);
        let handle = engine.spawn_workers(2, 16);
        handle.intake().send(miss("rx-1", t0())).await.unwrap();

        let mut delivered = false;
        for _ in 0..200 {
            if push.calls() == 1 {
                delivered = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(delivered);
        tokio::time::timeout(StdDuration::from_secs(5), handle.join())
            .await
            .unwrap();
    }
}
