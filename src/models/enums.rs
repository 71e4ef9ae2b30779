use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// Declaration order is the priority order: `Critical` sorts highest.
str_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Severity {
    /// One step up, saturating at `Critical`.
    pub fn raised(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

str_enum!(AlertState {
    Pending => "pending",
    Acknowledged => "acknowledged",
    Escalated => "escalated",
    Resolved => "resolved",
    Cancelled => "cancelled",
});

impl AlertState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    /// States whose SLA clock is running.
    pub fn awaits_acknowledgment(self) -> bool {
        matches!(self, Self::Pending | Self::Escalated)
    }

    /// The state-machine edges. Tier advances inside `Escalated` are not
    /// state transitions and go through the store's escalate path instead.
    pub fn can_transition_to(self, to: AlertState) -> bool {
        use AlertState::*;
        matches!(
            (self, to),
            (Pending, Acknowledged)
                | (Pending, Escalated)
                | (Acknowledged, Resolved)
                | (Escalated, Acknowledged)
                | (Escalated, Resolved)
                | (Pending, Cancelled)
                | (Acknowledged, Cancelled)
                | (Escalated, Cancelled)
        )
    }
}

str_enum!(SignalKind {
    AdherenceMiss => "adherence_miss",
    DoseTaken => "dose_taken",
    AppointmentMiss => "appointment_miss",
    AppointmentKept => "appointment_kept",
    SymptomReport => "symptom_report",
    Manual => "manual",
});

impl SignalKind {
    /// The rule kind this signal feeds. Resetting signals (a dose taken, an
    /// appointment kept) feed the same rules as the misses they cancel out.
    pub fn rule_kind(self) -> SignalKind {
        match self {
            Self::DoseTaken => Self::AdherenceMiss,
            Self::AppointmentKept => Self::AppointmentMiss,
            other => other,
        }
    }
}

str_enum!(ChannelKind {
    Push => "push",
    Sms => "sms",
    Voice => "voice",
});

str_enum!(DeliveryOutcome {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
    TimedOut => "timed_out",
});

str_enum!(HistoryEvent {
    Created => "created",
    Transition => "transition",
    TierAdvanced => "tier_advanced",
    FinalTierRepeat => "final_tier_repeat",
    Reassigned => "reassigned",
});

// Readmission risk recorded on the discharge summary.
str_enum!(RiskLevel {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl RiskLevel {
    pub fn is_high_risk(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}
