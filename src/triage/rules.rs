//! Alert rule configuration.
//!
//! Rules are loaded from a versioned JSON document and can be replaced at
//! runtime. A replacement must carry a strictly greater version and pass
//! validation, otherwise the active set stays in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::enums::{ChannelKind, Severity, SignalKind};

/// Re-notification interval at the final tier when neither the rule nor the
/// document sets one.
pub const DEFAULT_REPEAT_MINUTES: u32 = 15;

#[derive(Error, Debug)]
pub enum RuleConfigError {
    #[error("Cannot read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid rules JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid rule '{rule_id}': {reason}")]
    Validation { rule_id: String, reason: String },

    #[error("Rule set version {offered} is not newer than active version {current}")]
    StaleVersion { current: u64, offered: u64 },

    #[error("No rules file configured for reload")]
    NoSource,
}

impl RuleConfigError {
    fn invalid(rule_id: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            rule_id: rule_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// What makes a rule fire. Each variant consumes one family of signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Threshold {
    ConsecutiveMisses {
        count: u32,
    },
    AdherenceBelow {
        /// Minimum acceptable taken/total ratio, in (0, 1].
        ratio: f64,
        window: usize,
        min_samples: usize,
    },
    MissedAppointments {
        count: u32,
    },
    RedFlagSymptom {
        symptoms: Vec<String>,
        #[serde(default = "default_min_symptom_severity")]
        min_severity: u8,
    },
    Manual,
}

fn default_min_symptom_severity() -> u8 {
    1
}

impl Threshold {
    /// The signal family this threshold consumes.
    pub fn signal_kind(&self) -> SignalKind {
        match self {
            Self::ConsecutiveMisses { .. } | Self::AdherenceBelow { .. } => {
                SignalKind::AdherenceMiss
            }
            Self::MissedAppointments { .. } => SignalKind::AppointmentMiss,
            Self::RedFlagSymptom { .. } => SignalKind::SymptomReport,
            Self::Manual => SignalKind::Manual,
        }
    }

    fn validate(&self, rule_id: &str) -> Result<(), RuleConfigError> {
        match self {
            Self::ConsecutiveMisses { count } | Self::MissedAppointments { count } => {
                if *count == 0 {
                    return Err(RuleConfigError::invalid(rule_id, "count must be at least 1"));
                }
            }
            Self::AdherenceBelow {
                ratio,
                window,
                min_samples,
            } => {
                if !(*ratio > 0.0 && *ratio <= 1.0) {
                    return Err(RuleConfigError::invalid(rule_id, "ratio must be in (0, 1]"));
                }
                if *min_samples == 0 || min_samples > window {
                    return Err(RuleConfigError::invalid(
                        rule_id,
                        "min_samples must be between 1 and window",
                    ));
                }
            }
            Self::RedFlagSymptom {
                symptoms,
                min_severity,
            } => {
                if symptoms.is_empty() {
                    return Err(RuleConfigError::invalid(rule_id, "symptom list is empty"));
                }
                if !(1..=5).contains(min_severity) {
                    return Err(RuleConfigError::invalid(rule_id, "min_severity must be 1..=5"));
                }
            }
            Self::Manual => {}
        }
        Ok(())
    }
}

/// Which rolling-state slot and fingerprint a signal maps to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// One slot per subject.
    #[default]
    Subject,
    /// One slot per prescription, appointment or symptom.
    Item,
}

/// One rung of the escalation ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTier {
    pub name: String,
    pub responder: String,
    pub sla_minutes: u32,
    /// Tried in order until one delivers.
    pub channels: Vec<ChannelKind>,
}

impl EscalationTier {
    pub fn sla(&self) -> Duration {
        Duration::minutes(i64::from(self.sla_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub signal_kind: SignalKind,
    pub threshold: Threshold,
    pub severity: Severity,
    pub tiers: Vec<EscalationTier>,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub auto_cancel_on_recovery: bool,
    /// Raise severity one step for subjects discharged at high or critical
    /// readmission risk.
    #[serde(default)]
    pub raise_for_high_risk: bool,
    #[serde(default)]
    pub final_tier_repeat_minutes: Option<u32>,
}

impl AlertRule {
    pub fn tier(&self, index: u32) -> Option<&EscalationTier> {
        self.tiers.get(index as usize)
    }

    pub fn last_tier_index(&self) -> u32 {
        self.tiers.len().saturating_sub(1) as u32
    }

    pub fn repeat_interval(&self, default_minutes: u32) -> Duration {
        let minutes = self.final_tier_repeat_minutes.unwrap_or(default_minutes);
        Duration::minutes(i64::from(minutes))
    }

    fn validate(&self) -> Result<(), RuleConfigError> {
        if self.id.trim().is_empty() {
            return Err(RuleConfigError::invalid(&self.id, "id is empty"));
        }
        if self.threshold.signal_kind() != self.signal_kind {
            return Err(RuleConfigError::invalid(
                &self.id,
                format!(
                    "threshold consumes {} signals but rule is declared for {}",
                    self.threshold.signal_kind(),
                    self.signal_kind
                ),
            ));
        }
        self.threshold.validate(&self.id)?;

        if self.tiers.is_empty() {
            return Err(RuleConfigError::invalid(&self.id, "at least one tier is required"));
        }
        for tier in &self.tiers {
            if tier.sla_minutes == 0 {
                return Err(RuleConfigError::invalid(
                    &self.id,
                    format!("tier '{}' has a zero SLA", tier.name),
                ));
            }
            if tier.channels.is_empty() {
                return Err(RuleConfigError::invalid(
                    &self.id,
                    format!("tier '{}' has no channels", tier.name),
                ));
            }
        }
        if self.final_tier_repeat_minutes == Some(0) {
            return Err(RuleConfigError::invalid(
                &self.id,
                "final_tier_repeat_minutes must be positive",
            ));
        }
        Ok(())
    }
}

/// A complete, versioned rule document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: u64,
    #[serde(default = "default_repeat_minutes")]
    pub default_repeat_minutes: u32,
    pub rules: Vec<AlertRule>,
}

fn default_repeat_minutes() -> u32 {
    DEFAULT_REPEAT_MINUTES
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self, RuleConfigError> {
        let set: RuleSet = serde_json::from_str(json)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self, RuleConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| RuleConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), RuleConfigError> {
        if self.default_repeat_minutes == 0 {
            return Err(RuleConfigError::invalid(
                "*",
                "default_repeat_minutes must be positive",
            ));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleConfigError::invalid(&rule.id, "duplicate rule id"));
            }
            rule.validate()?;
        }
        Ok(())
    }

    pub fn rule(&self, id: &str) -> Option<&AlertRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Rules fed by a signal of this kind (resetting kinds included).
    pub fn rules_for(&self, kind: SignalKind) -> impl Iterator<Item = &AlertRule> {
        let wanted = kind.rule_kind();
        self.rules.iter().filter(move |r| r.signal_kind == wanted)
    }
}

/// Holder of the active rule set. Readers get a cheap `Arc` snapshot, so a
/// reload never changes the rules under an evaluation in progress.
#[derive(Debug)]
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
    source: Option<PathBuf>,
}

impl RuleRegistry {
    pub fn new(set: RuleSet) -> Result<Self, RuleConfigError> {
        set.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            source: None,
        })
    }

    /// Load from a file and remember the path for `reload`.
    pub fn from_file(path: &Path) -> Result<Self, RuleConfigError> {
        let set = RuleSet::load(path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            source: Some(path.to_path_buf()),
        })
    }

    pub fn current(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Swap in a new rule set. Returns the new version.
    pub fn replace(&self, set: RuleSet) -> Result<u64, RuleConfigError> {
        set.validate()?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.version <= guard.version {
            return Err(RuleConfigError::StaleVersion {
                current: guard.version,
                offered: set.version,
            });
        }
        let version = set.version;
        *guard = Arc::new(set);
        tracing::info!(version, "Rule set replaced");
        Ok(version)
    }

    /// Re-read the file this registry was loaded from.
    pub fn reload(&self) -> Result<u64, RuleConfigError> {
        let path = self.source.as_deref().ok_or(RuleConfigError::NoSource)?;
        let set = RuleSet::load(path)?;
        self.replace(set)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use super::*;

    pub(crate) fn tier(name: &str, sla_minutes: u32, channels: &[ChannelKind]) -> EscalationTier {
        EscalationTier {
            name: name.into(),
            responder: format!("{name}-on-call"),
            sla_minutes,
            channels: channels.to_vec(),
        }
    }

    pub(crate) fn missed_dose_rule(count: u32) -> AlertRule {
        AlertRule {
            id: "missed-doses".into(),
            signal_kind: SignalKind::AdherenceMiss,
            threshold: Threshold::ConsecutiveMisses { count },
            severity: Severity::High,
            tiers: vec![
                tier("primary", 30, &[ChannelKind::Push]),
                tier("charge", 60, &[ChannelKind::Sms]),
            ],
            scope: RuleScope::Item,
            auto_cancel_on_recovery: false,
            raise_for_high_risk: false,
            final_tier_repeat_minutes: None,
        }
    }

    fn set(version: u64, rules: Vec<AlertRule>) -> RuleSet {
        RuleSet {
            version,
            default_repeat_minutes: DEFAULT_REPEAT_MINUTES,
            rules,
        }
    }

    #[test]
    fn parses_tagged_thresholds() {
        let json = r#"{
            "version": 3,
            "rules": [{
                "id": "red-flags",
                "signal_kind": "symptom_report",
                "threshold": { "type": "red_flag_symptom", "symptoms": ["chest pain"], "min_severity": 3 },
                "severity": "critical",
                "scope": "item",
                "tiers": [{ "name": "nurse", "responder": "ward-a", "sla_minutes": 10, "channels": ["push", "sms"] }]
            }]
        }"#;
        let set = RuleSet::from_json(json).unwrap();
        assert_eq!(set.version, 3);
        assert_eq!(set.default_repeat_minutes, DEFAULT_REPEAT_MINUTES);
        let rule = set.rule("red-flags").unwrap();
        assert_eq!(
            rule.threshold,
            Threshold::RedFlagSymptom {
                symptoms: vec!["chest pain".into()],
                min_severity: 3
            }
        );
        assert_eq!(rule.tiers[0].channels, vec![ChannelKind::Push, ChannelKind::Sms]);
        assert!(!rule.auto_cancel_on_recovery);
    }

    #[test]
    fn rejects_rule_without_tiers() {
        let mut rule = missed_dose_rule(3);
        rule.tiers.clear();
        let err = set(1, vec![rule]).validate().unwrap_err();
        assert!(matches!(err, RuleConfigError::Validation { .. }));
    }

    #[test]
    fn rejects_zero_sla_and_empty_channels() {
        let mut rule = missed_dose_rule(3);
        rule.tiers[1].sla_minutes = 0;
        assert!(set(1, vec![rule]).validate().is_err());

        let mut rule = missed_dose_rule(3);
        rule.tiers[0].channels.clear();
        assert!(set(1, vec![rule]).validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ids_and_mismatched_kind() {
        let err = set(1, vec![missed_dose_rule(3), missed_dose_rule(4)])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        let mut rule = missed_dose_rule(3);
        rule.signal_kind = SignalKind::SymptomReport;
        assert!(set(1, vec![rule]).validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_adherence_threshold() {
        let mut rule = missed_dose_rule(3);
        rule.threshold = Threshold::AdherenceBelow {
            ratio: 1.5,
            window: 10,
            min_samples: 5,
        };
        assert!(set(1, vec![rule.clone()]).validate().is_err());

        rule.threshold = Threshold::AdherenceBelow {
            ratio: 0.8,
            window: 4,
            min_samples: 5,
        };
        assert!(set(1, vec![rule]).validate().is_err());
    }

    #[test]
    fn rules_for_includes_resetting_kinds() {
        let rules = set(1, vec![missed_dose_rule(3)]);
        assert_eq!(rules.rules_for(SignalKind::DoseTaken).count(), 1);
        assert_eq!(rules.rules_for(SignalKind::AdherenceMiss).count(), 1);
        assert_eq!(rules.rules_for(SignalKind::AppointmentMiss).count(), 0);
    }

    #[test]
    fn repeat_interval_prefers_rule_override() {
        let mut rule = missed_dose_rule(3);
        assert_eq!(rule.repeat_interval(15), Duration::minutes(15));
        rule.final_tier_repeat_minutes = Some(5);
        assert_eq!(rule.repeat_interval(15), Duration::minutes(5));
        assert_eq!(rule.last_tier_index(), 1);
    }

    #[test]
    fn replace_requires_newer_version() {
        let registry = RuleRegistry::new(set(2, vec![missed_dose_rule(3)])).unwrap();

        let err = registry.replace(set(2, vec![])).unwrap_err();
        assert!(matches!(
            err,
            RuleConfigError::StaleVersion {
                current: 2,
                offered: 2
            }
        ));
        assert_eq!(registry.current().rules.len(), 1);

        assert_eq!(registry.replace(set(3, vec![])).unwrap(), 3);
        assert!(registry.current().rules.is_empty());
    }

    #[test]
    fn invalid_replacement_keeps_active_set() {
        let registry = RuleRegistry::new(set(1, vec![missed_dose_rule(3)])).unwrap();
        let mut broken = missed_dose_rule(0);
        broken.id = "broken".into();
        assert!(registry.replace(set(5, vec![broken])).is_err());
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn reload_reads_source_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&set(1, vec![missed_dose_rule(3)])).unwrap())
            .unwrap();
        let registry = RuleRegistry::from_file(file.path()).unwrap();
        assert_eq!(registry.version(), 1);

        std::fs::write(
            file.path(),
            serde_json::to_string(&set(2, vec![missed_dose_rule(4)])).unwrap(),
        )
        .unwrap();
        assert_eq!(registry.reload().unwrap(), 2);
        assert_eq!(
            registry.current().rule("missed-doses").unwrap().threshold,
            Threshold::ConsecutiveMisses { count: 4 }
        );
    }

    #[test]
    fn reload_without_source_fails() {
        let registry = RuleRegistry::new(set(1, vec![])).unwrap();
        assert!(matches!(registry.reload(), Err(RuleConfigError::NoSource)));
    }
}
