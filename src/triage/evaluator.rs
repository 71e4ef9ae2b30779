//! Rule evaluation.
//!
//! Pure functions from `(rule, signal, rolling state)` to a decision. The
//! caller loads and persists the rolling state; nothing here touches storage
//! or the clock.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rules::{AlertRule, RuleScope, Threshold};
use crate::models::enums::SignalKind;
use crate::models::{AlertTrigger, Signal, SignalPayload};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Rule '{rule_id}' cannot evaluate a {kind} signal")]
    PayloadMismatch { rule_id: String, kind: SignalKind },

    #[error("Rule '{rule_id}' is item-scoped but the {kind} signal names no item")]
    MissingItem { rule_id: String, kind: SignalKind },
}

/// Per-(subject, rule, item) memory carried between signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingState {
    /// Consecutive misses since the last reset.
    pub streak: u32,
    /// Recent adherence outcomes, oldest first (`true` = dose taken).
    #[serde(default)]
    pub samples: VecDeque<bool>,
    /// Set while the rule's condition holds; fires happen on the way in.
    pub tripped: bool,
}

impl RollingState {
    /// Forget that the condition already fired. The next signal that finds
    /// the condition holding fires again. Used once the alert that stood for
    /// it has been closed.
    pub fn rearm(&mut self) {
        self.tripped = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Trigger(AlertTrigger),
    /// The condition that tripped the rule no longer holds.
    Recovered { fingerprint: String },
    Quiet,
}

/// Whether a rule is fed by this signal at all.
pub fn applies_to(rule: &AlertRule, signal: &Signal) -> bool {
    rule.signal_kind == signal.kind.rule_kind()
}

/// Rolling-state slot within `(subject, rule)`; empty for subject scope.
pub fn scope_key(rule: &AlertRule, signal: &Signal) -> Result<String, EvaluationError> {
    match rule.scope {
        RuleScope::Subject => Ok(String::new()),
        RuleScope::Item => signal
            .payload
            .item_key()
            .map(str::to_string)
            .ok_or_else(|| EvaluationError::MissingItem {
                rule_id: rule.id.clone(),
                kind: signal.kind,
            }),
    }
}

/// Deterministic identity of the condition a trigger describes.
pub fn fingerprint_for(rule: &AlertRule, signal: &Signal) -> Result<String, EvaluationError> {
    let scope = scope_key(rule, signal)?;
    if scope.is_empty() {
        Ok(format!("{}:{}", rule.id, signal.subject_id))
    } else {
        Ok(format!("{}:{}:{}", rule.id, signal.subject_id, scope))
    }
}

/// Evaluate one rule against one signal, updating `state` in place.
pub fn evaluate_rule(
    rule: &AlertRule,
    signal: &Signal,
    state: &mut RollingState,
) -> Result<RuleOutcome, EvaluationError> {
    let mismatch = || EvaluationError::PayloadMismatch {
        rule_id: rule.id.clone(),
        kind: signal.kind,
    };
    if !applies_to(rule, signal) {
        return Err(mismatch());
    }

    let crossing = match (&rule.threshold, &signal.payload) {
        (Threshold::ConsecutiveMisses { count }, SignalPayload::AdherenceMiss { .. })
        | (Threshold::MissedAppointments { count }, SignalPayload::AppointmentMiss { .. }) => {
            state.streak = state.streak.saturating_add(1);
            let above = state.streak >= *count;
            Crossing::from_level(state, above)
        }
        (Threshold::ConsecutiveMisses { .. }, SignalPayload::DoseTaken { .. })
        | (Threshold::MissedAppointments { .. }, SignalPayload::AppointmentKept { .. }) => {
            state.streak = 0;
            Crossing::from_level(state, false)
        }
        (
            Threshold::AdherenceBelow {
                ratio,
                window,
                min_samples,
            },
            SignalPayload::AdherenceMiss { .. } | SignalPayload::DoseTaken { .. },
        ) => {
            let taken = matches!(signal.payload, SignalPayload::DoseTaken { .. });
            state.samples.push_back(taken);
            while state.samples.len() > *window {
                state.samples.pop_front();
            }
            if state.samples.len() < *min_samples {
                Crossing::None
            } else {
                let taken_count = state.samples.iter().filter(|t| **t).count();
                let observed = taken_count as f64 / state.samples.len() as f64;
                Crossing::from_level(state, observed < *ratio)
            }
        }
        (
            Threshold::RedFlagSymptom {
                symptoms,
                min_severity,
            },
            SignalPayload::SymptomReport { symptom, severity },
        ) => {
            if !symptoms.iter().any(|s| s.eq_ignore_ascii_case(symptom)) {
                Crossing::None
            } else if severity >= min_severity {
                // Every qualifying report is a fresh observation; an alert
                // that is still open absorbs it through deduplication.
                state.tripped = true;
                Crossing::Up
            } else {
                Crossing::from_level(state, false)
            }
        }
        (Threshold::Manual, SignalPayload::Manual { .. }) => Crossing::Up,
        _ => return Err(mismatch()),
    };

    match crossing {
        Crossing::Up => Ok(RuleOutcome::Trigger(AlertTrigger {
            rule_id: rule.id.clone(),
            subject_id: signal.subject_id.clone(),
            severity: trigger_severity(rule, signal),
            fingerprint: fingerprint_for(rule, signal)?,
            signal_id: signal.id,
            occurred_at: signal.occurred_at,
        })),
        Crossing::Down => Ok(RuleOutcome::Recovered {
            fingerprint: fingerprint_for(rule, signal)?,
        }),
        Crossing::None => Ok(RuleOutcome::Quiet),
    }
}

/// Convenience over `evaluate_rule` for callers that only care about
/// triggers.
pub fn evaluate(
    rule: &AlertRule,
    signal: &Signal,
    state: &mut RollingState,
) -> Option<AlertTrigger> {
    match evaluate_rule(rule, signal, state) {
        Ok(RuleOutcome::Trigger(trigger)) => Some(trigger),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(rule_id = %rule.id, error = %e, "Rule evaluation failed");
            None
        }
    }
}

enum Crossing {
    Up,
    Down,
    None,
}

impl Crossing {
    /// Compare the new level against the tripped flag and record it.
    fn from_level(state: &mut RollingState, above: bool) -> Self {
        let was = state.tripped;
        state.tripped = above;
        match (was, above) {
            (false, true) => Self::Up,
            (true, false) => Self::Down,
            _ => Self::None,
        }
    }
}

fn trigger_severity(rule: &AlertRule, signal: &Signal) -> crate::models::enums::Severity {
    let base = match &signal.payload {
        SignalPayload::Manual { severity, .. } => *severity,
        _ => rule.severity,
    };
    let high_risk = signal.subject_risk.is_some_and(|r| r.is_high_risk());
    if rule.raise_for_high_risk && high_risk {
        base.raised()
    } else {
        base
    }
}
