//! End-to-end behaviour of the engine under virtual time.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use super::dispatcher::RetryPolicy;
use super::engine::{RuleDecision, TriageEngine};
use super::events::EngineEvent;
use super::intake::SignalSubmission;
use super::rules::tests::{missed_dose_rule, tier};
use super::rules::{AlertRule, RuleRegistry, RuleScope, RuleSet, Threshold};
use super::scheduler::ExpiryOutcome;
use super::store::AlertStore;
use super::{Clock, ManualClock, TriageError};
use crate::channels::testing::ScriptedChannel;
use crate::channels::ChannelRegistry;
use crate::models::enums::{
    AlertState, ChannelKind, DeliveryOutcome, HistoryEvent, Severity, SignalKind,
};
use crate::models::AlertFilter;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 22, 0, 0).unwrap()
}

fn red_flag_rule() -> AlertRule {
    AlertRule {
        id: "red-flag-symptoms".into(),
        signal_kind: SignalKind::SymptomReport,
        threshold: Threshold::RedFlagSymptom {
            symptoms: vec!["chest pain".into(), "shortness of breath".into()],
            min_severity: 3,
        },
        severity: Severity::Critical,
        tiers: vec![
            tier("ward-nurse", 10, &[ChannelKind::Push]),
            tier("charge-nurse", 30, &[ChannelKind::Sms, ChannelKind::Voice]),
        ],
        scope: RuleScope::Item,
        auto_cancel_on_recovery: false,
        raise_for_high_risk: false,
        final_tier_repeat_minutes: None,
    }
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts_per_channel: 2,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(2),
        jitter: 0.0,
        send_timeout: std::time::Duration::from_millis(500),
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    engine: Arc<TriageEngine>,
}

impl Harness {
    fn new(rules: Vec<AlertRule>, channels: ChannelRegistry) -> Self {
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
        let engine = Arc::new(TriageEngine::new(store, registry, channels, quick_policy()));
        Self { clock, engine }
    }

    fn healthy(rules: Vec<AlertRule>) -> Self {
        Self::new(
            rules,
            ChannelRegistry::new()
                .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Push)))
                .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Sms)))
                .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Voice))),
        )
    }

    fn symptom(&self, subject: &str, symptom: &str, severity: u8) -> SignalSubmission {
        SignalSubmission {
            kind: "symptom_report".into(),
            subject_id: subject.into(),
            occurred_at: self.clock.now(),
            payload: json!({ "symptom": symptom, "severity": severity }),
            subject_risk: None,
        }
    }

    fn miss(&self, subject: &str, rx: &str) -> SignalSubmission {
        SignalSubmission {
            kind: "adherence_miss".into(),
            subject_id: subject.into(),
            occurred_at: self.clock.now(),
            payload: json!({ "prescription_id": rx }),
            subject_risk: None,
        }
    }

    fn open(&self, submission: &SignalSubmission) -> Uuid {
        let report = self.engine.submit(submission).unwrap();
        let created = report.created();
        assert_eq!(created.len(), 1, "expected one alert, got {:?}", report.decisions);
        created[0]
    }
}

#[tokio::test]
async fn critical_alert_escalates_after_tier_zero_sla() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let alert_id = h.open(&h.symptom("patient-1", "Chest pain", 4));
    h.engine.dispatcher().drain().await;

    h.clock.advance(Duration::minutes(11));
    let outcomes = h.engine.scheduler().fire_due().await;
    assert_eq!(
        outcomes,
        vec![ExpiryOutcome::Escalated {
            alert_id,
            tier_index: 1
        }]
    );
    h.engine.dispatcher().drain().await;

    let alert = h.engine.store().get(alert_id).unwrap();
    assert_eq!(alert.state, AlertState::Escalated);
    assert_eq!(alert.current_tier_index, 1);

    let attempts = h.engine.store().attempts_for(alert_id).unwrap();
    let tiers: Vec<_> = attempts.iter().map(|a| (a.tier_index, a.channel)).collect();
    assert_eq!(tiers, vec![(0, ChannelKind::Push), (1, ChannelKind::Sms)]);
    assert!(attempts.iter().all(|a| a.outcome == DeliveryOutcome::Delivered));
}

#[tokio::test]
async fn escalation_happens_within_tolerance_of_sla() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let alert_id = h.open(&h.symptom("patient-2", "shortness of breath", 5));

    // Not yet due one second early.
    h.clock.advance(Duration::minutes(10) - Duration::seconds(1));
    assert!(h.engine.scheduler().fire_due().await.is_empty());
    h.clock.advance(Duration::seconds(1));
    h.engine.scheduler().fire_due().await;

    let alert = h.engine.store().get(alert_id).unwrap();
    let advanced = h
        .engine
        .store()
        .history(alert_id)
        .unwrap()
        .into_iter()
        .find(|r| r.event == HistoryEvent::TierAdvanced)
        .unwrap();
    let elapsed = advanced.at - alert.created_at;
    assert!((elapsed - Duration::minutes(10)).num_milliseconds().abs() <= 1_000);
}

#[tokio::test]
async fn third_consecutive_miss_opens_exactly_one_alert() {
    let h = Harness::healthy(vec![missed_dose_rule(3)]);

    for n in 1..=3 {
        let report = h.engine.submit(&h.miss("patient-3", "rx-77")).unwrap();
        let created = report.created();
        if n < 3 {
            assert!(created.is_empty(), "signal {n} must not open an alert");
        } else {
            assert_eq!(created.len(), 1);
        }
        h.clock.advance(Duration::hours(12));
    }

    let open = h.engine.store().list_open(&AlertFilter::default()).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].fingerprint, "missed-doses:patient-3:rx-77");
}

#[tokio::test]
async fn acknowledgment_just_before_deadline_prevents_escalation() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let alert_id = h.open(&h.symptom("patient-4", "chest pain", 3));
    h.engine.dispatcher().drain().await;

    h.clock.advance(Duration::minutes(10) - Duration::seconds(1));
    h.engine.responses().acknowledge(alert_id, "nurse-kim").unwrap();
    h.clock.advance(Duration::seconds(2));

    assert!(h.engine.scheduler().fire_due().await.is_empty());
    assert!(h.engine.dispatcher().drain().await.is_empty());

    let alert = h.engine.store().get(alert_id).unwrap();
    assert_eq!(alert.state, AlertState::Acknowledged);
    let attempts = h.engine.store().attempts_for(alert_id).unwrap();
    assert!(attempts.iter().all(|a| a.tier_index == 0));
}

#[tokio::test]
async fn exhausted_channels_do_not_pause_the_sla_clock() {
    let h = Harness::new(
        vec![red_flag_rule()],
        ChannelRegistry::new()
            .with(Arc::new(ScriptedChannel::always_failing(ChannelKind::Push)))
            .with(Arc::new(ScriptedChannel::always_failing(ChannelKind::Sms)))
            .with(Arc::new(ScriptedChannel::always_failing(ChannelKind::Voice))),
    );
    let mut events = h.engine.subscribe();
    let alert_id = h.open(&h.symptom("patient-5", "chest pain", 5));
    let before = h.engine.store().get(alert_id).unwrap().tier_deadline;

    let reports = h.engine.dispatcher().drain().await;
    assert!(!reports[0].delivered);
    let exhausted = loop {
        match events.recv().await.unwrap() {
            EngineEvent::DispatchExhausted { alert_id: id, .. } => break id,
            _ => continue,
        }
    };
    assert_eq!(exhausted, alert_id);

    let after = h.engine.store().get(alert_id).unwrap();
    assert_eq!(after.tier_deadline, before);
    assert_eq!(h.engine.scheduler().armed(alert_id).unwrap().deadline, before.unwrap());

    h.clock.advance(Duration::minutes(10));
    assert!(matches!(
        h.engine.scheduler().fire_due().await[..],
        [ExpiryOutcome::Escalated { tier_index: 1, .. }]
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_expiry_leaves_one_terminal_transition() {
    for round in 0..25 {
        let h = Harness::healthy(vec![red_flag_rule()]);
        let alert_id = h.open(&h.symptom(&format!("patient-{round}"), "chest pain", 4));
        h.clock.advance(Duration::minutes(10));

        let engine = Arc::clone(&h.engine);
        let cancel = tokio::task::spawn_blocking(move || {
            engine.responses().cancel(alert_id, "readmitted")
        });
        let scheduler = Arc::clone(h.engine.scheduler());
        let expiry = tokio::spawn(async move { scheduler.fire_due().await });

        let cancel_result = cancel.await.unwrap();
        expiry.await.unwrap();

        assert!(cancel_result.is_ok(), "round {round}: {cancel_result:?}");
        let alert = h.engine.store().get(alert_id).unwrap();
        assert_eq!(alert.state, AlertState::Cancelled);
        let terminal = h
            .engine
            .store()
            .history(alert_id)
            .unwrap()
            .iter()
            .filter(|r| r.to_state.is_terminal())
            .count();
        assert_eq!(terminal, 1, "round {round}");
        assert_eq!(h.engine.scheduler().armed_count(), 0, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_signals_open_one_alert() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let engine = Arc::clone(&h.engine);
            // Distinct reports (different severities) of the same condition.
            let submission = h.symptom("patient-9", "chest pain", 3 + (n % 3) as u8);
            let submission = SignalSubmission {
                occurred_at: submission.occurred_at + Duration::seconds(n),
                ..submission
            };
            tokio::task::spawn_blocking(move || engine.submit(&submission).unwrap())
        })
        .collect();

    let mut created = 0;
    let mut merged = 0;
    for task in tasks {
        for decision in task.await.unwrap().decisions {
            match decision {
                RuleDecision::Created { .. } => created += 1,
                RuleDecision::Merged { .. } => merged += 1,
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }
    assert_eq!(created, 1);
    assert_eq!(merged, 15);
    assert_eq!(h.engine.store().list_open(&AlertFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn critical_dispatch_is_not_starved_by_low_severity_backlog() {
    let mut routine = missed_dose_rule(1);
    routine.severity = Severity::Low;
    let h = Harness::healthy(vec![routine, red_flag_rule()]);

    for n in 0..30 {
        h.open(&h.miss(&format!("patient-{n}"), "rx-1"));
    }
    let critical = h.open(&h.symptom("patient-99", "chest pain", 5));

    let reports = h.engine.dispatcher().drain().await;
    assert_eq!(reports.len(), 31);
    assert_eq!(reports[0].alert_id, critical);
}

#[tokio::test]
async fn restart_recovers_timers_from_stored_deadlines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("triage.db");
    let clock = Arc::new(ManualClock::new(t0()));
    let rules = || {
        Arc::new(
            RuleRegistry::new(RuleSet {
                version: 1,
                default_repeat_minutes: 15,
                rules: vec![red_flag_rule()],
            })
            .unwrap(),
        )
    };
    let channels = || {
        ChannelRegistry::new()
            .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Push)))
            .with(Arc::new(ScriptedChannel::always_ok(ChannelKind::Sms)))
    };

    let alert_id = {
        let store = Arc::new(AlertStore::open(&path, clock.clone()).unwrap());
        let engine = TriageEngine::new(store, rules(), channels(), quick_policy());
        let submission = SignalSubmission {
            kind: "symptom_report".into(),
            subject_id: "patient-r".into(),
            occurred_at: t0(),
            payload: json!({ "symptom": "chest pain", "severity": 5 }),
            subject_risk: Some("high".into()),
        };
        engine.submit(&submission).unwrap().created()[0]
    };

    // Down for 25 minutes: past the tier-0 deadline.
    clock.advance(Duration::minutes(25));
    let store = Arc::new(AlertStore::open(&path, clock.clone()).unwrap());
    let engine = TriageEngine::new(store, rules(), channels(), quick_policy());
    assert_eq!(engine.recover().unwrap(), 1);

    let outcomes = Arc::clone(engine.scheduler()).fire_due().await;
    assert_eq!(
        outcomes,
        vec![ExpiryOutcome::Escalated {
            alert_id,
            tier_index: 1
        }]
    );
    let alert = engine.store().get(alert_id).unwrap();
    assert_eq!(alert.tier_deadline, Some(clock.now() + Duration::minutes(30)));
}

#[tokio::test]
async fn invalid_transitions_leave_alert_unchanged() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let alert_id = h.open(&h.symptom("patient-6", "chest pain", 4));
    let tracker = h.engine.responses();

    tracker.acknowledge(alert_id, "nurse-a").unwrap();
    tracker.resolve(alert_id, "nurse-a", Some("sent to ED")).unwrap();
    let history_before = h.engine.store().history(alert_id).unwrap().len();

    for result in [
        tracker.acknowledge(alert_id, "nurse-b"),
        tracker.resolve(alert_id, "nurse-b", None),
        tracker.cancel(alert_id, "late"),
    ] {
        assert!(matches!(
            result,
            Err(TriageError::InvalidTransition {
                current: AlertState::Resolved,
                ..
            })
        ));
    }
    let alert = h.engine.store().get(alert_id).unwrap();
    assert_eq!(alert.state, AlertState::Resolved);
    assert_eq!(h.engine.store().history(alert_id).unwrap().len(), history_before);
}

#[tokio::test]
async fn reload_with_stale_version_keeps_rules() {
    let h = Harness::healthy(vec![red_flag_rule()]);
    let err = h
        .engine
        .rules()
        .replace(RuleSet {
            version: 1,
            default_repeat_minutes: 15,
            rules: vec![],
        })
        .unwrap_err();
    assert!(matches!(err, super::RuleConfigError::StaleVersion { .. }));
    assert!(h.engine.rules().current().rule("red-flag-symptoms").is_some());
}
