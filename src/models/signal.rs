use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::enums::{RiskLevel, Severity, SignalKind};

/// Immutable, normalized fact reported by a collaborator system.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: Uuid,
    pub kind: SignalKind,
    pub subject_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: SignalPayload,
    /// Readmission risk from the subject's latest discharge summary, if the
    /// collaborator supplied it.
    pub subject_risk: Option<RiskLevel>,
    /// Signal-level idempotency key (hex SHA-256).
    pub fingerprint: String,
}

/// Kind-specific signal fields. Parsed per kind by intake, so the
/// serialized form carries no tag of its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalPayload {
    AdherenceMiss {
        prescription_id: String,
        scheduled_for: Option<DateTime<Utc>>,
    },
    DoseTaken {
        prescription_id: String,
    },
    AppointmentMiss {
        appointment_id: String,
    },
    AppointmentKept {
        appointment_id: String,
    },
    SymptomReport {
        symptom: String,
        severity: u8,
    },
    Manual {
        reason: String,
        severity: Severity,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::AdherenceMiss { .. } => SignalKind::AdherenceMiss,
            Self::DoseTaken { .. } => SignalKind::DoseTaken,
            Self::AppointmentMiss { .. } => SignalKind::AppointmentMiss,
            Self::AppointmentKept { .. } => SignalKind::AppointmentKept,
            Self::SymptomReport { .. } => SignalKind::SymptomReport,
            Self::Manual { .. } => SignalKind::Manual,
        }
    }

    /// The prescription, appointment or symptom the signal is about.
    pub fn item_key(&self) -> Option<&str> {
        match self {
            Self::AdherenceMiss { prescription_id, .. } | Self::DoseTaken { prescription_id } => {
                Some(prescription_id)
            }
            Self::AppointmentMiss { appointment_id } | Self::AppointmentKept { appointment_id } => {
                Some(appointment_id)
            }
            Self::SymptomReport { symptom, .. } => Some(symptom),
            Self::Manual { .. } => None,
        }
    }
}
