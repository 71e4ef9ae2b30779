//! Signal intake: validation and normalization of collaborator submissions.
//!
//! A submission is loose JSON; a `Signal` is the typed, normalized fact the
//! evaluator consumes. Each signal gets a content fingerprint (SHA-256 over
//! kind, subject, time and payload) and an id derived from it, so the same
//! report submitted twice maps to the same signal.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::enums::{RiskLevel, Severity, SignalKind};
use crate::models::{Signal, SignalPayload};

/// Namespace for signal ids (UUIDv5 over the signal fingerprint).
const SIGNAL_NAMESPACE: Uuid = Uuid::from_u128(0x3c1e_9f2a_7b44_4d0e_a6f1_52c8_0d91_be37);

/// Symptom severities are reported on a 1..=5 scale.
const SYMPTOM_SEVERITY_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntakeError {
    #[error("Unknown signal kind: {0}")]
    UnknownKind(String),

    #[error("Subject id is empty")]
    EmptySubject,

    #[error("Malformed {kind} payload: missing field '{field}'")]
    MissingField { kind: SignalKind, field: &'static str },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A signal as submitted by a collaborator (HTTP body or intake queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSubmission {
    pub kind: String,
    pub subject_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub subject_risk: Option<String>,
}

/// Validate and normalize a submission.
pub fn normalize(submission: &SignalSubmission) -> Result<Signal, IntakeError> {
    let kind = SignalKind::from_str(submission.kind.trim())
        .map_err(|_| IntakeError::UnknownKind(submission.kind.clone()))?;

    let subject_id = submission.subject_id.trim();
    if subject_id.is_empty() {
        return Err(IntakeError::EmptySubject);
    }

    let subject_risk = match submission.subject_risk.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(RiskLevel::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
            IntakeError::InvalidField {
                field: "subject_risk",
                reason: format!("unknown risk level '{raw}'"),
            }
        })?),
    };

    let payload = parse_payload(kind, &submission.payload)?;
    let fingerprint = signal_fingerprint(kind, subject_id, submission.occurred_at, &payload);
    let id = Uuid::new_v5(&SIGNAL_NAMESPACE, fingerprint.as_bytes());

    Ok(Signal {
        id,
        kind,
        subject_id: subject_id.to_string(),
        occurred_at: submission.occurred_at,
        payload,
        subject_risk,
        fingerprint,
    })
}

fn parse_payload(kind: SignalKind, data: &serde_json::Value) -> Result<SignalPayload, IntakeError> {
    let payload = match kind {
        SignalKind::AdherenceMiss => SignalPayload::AdherenceMiss {
            prescription_id: required_str(kind, data, "prescription_id")?,
            scheduled_for: optional_datetime(data, "scheduled_for")?,
        },
        SignalKind::DoseTaken => SignalPayload::DoseTaken {
            prescription_id: required_str(kind, data, "prescription_id")?,
        },
        SignalKind::AppointmentMiss => SignalPayload::AppointmentMiss {
            appointment_id: required_str(kind, data, "appointment_id")?,
        },
        SignalKind::AppointmentKept => SignalPayload::AppointmentKept {
            appointment_id: required_str(kind, data, "appointment_id")?,
        },
        SignalKind::SymptomReport => {
            let symptom = normalize_symptom(&required_str(kind, data, "symptom")?);
            let severity = data
                .get("severity")
                .ok_or(IntakeError::MissingField {
                    kind,
                    field: "severity",
                })?
                .as_u64()
                .and_then(|v| u8::try_from(v).ok())
                .filter(|v| SYMPTOM_SEVERITY_RANGE.contains(v))
                .ok_or_else(|| IntakeError::InvalidField {
                    field: "severity",
                    reason: "must be an integer from 1 to 5".into(),
                })?;
            SignalPayload::SymptomReport { symptom, severity }
        }
        SignalKind::Manual => {
            let reason = required_str(kind, data, "reason")?;
            let raw = required_str(kind, data, "severity")?;
            let severity = Severity::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
                IntakeError::InvalidField {
                    field: "severity",
                    reason: format!("unknown severity '{raw}'"),
                }
            })?;
            SignalPayload::Manual { reason, severity }
        }
    };
    Ok(payload)
}

fn required_str(
    kind: SignalKind,
    data: &serde_json::Value,
    field: &'static str,
) -> Result<String, IntakeError> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(IntakeError::MissingField { kind, field })
}

fn optional_datetime(
    data: &serde_json::Value,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, IntakeError> {
    match data.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .ok_or_else(|| IntakeError::InvalidField {
                field,
                reason: "expected an RFC 3339 timestamp".into(),
            }),
    }
}

/// Lower-case, trimmed, single-spaced.
fn normalize_symptom(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn signal_fingerprint(
    kind: SignalKind,
    subject_id: &str,
    occurred_at: DateTime<Utc>,
    payload: &SignalPayload,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(subject_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(occurred_at.to_rfc3339().as_bytes());
    hasher.update(b"\x1f");
    match payload {
        SignalPayload::AdherenceMiss {
            prescription_id,
            scheduled_for,
        } => {
            hasher.update(prescription_id.as_bytes());
            if let Some(at) = scheduled_for {
                hasher.update(b"\x1f");
                hasher.update(at.to_rfc3339().as_bytes());
            }
        }
        SignalPayload::DoseTaken { prescription_id } => hasher.update(prescription_id.as_bytes()),
        SignalPayload::AppointmentMiss { appointment_id }
        | SignalPayload::AppointmentKept { appointment_id } => {
            hasher.update(appointment_id.as_bytes())
        }
        SignalPayload::SymptomReport { symptom, severity } => {
            hasher.update(symptom.as_bytes());
            hasher.update([*severity]);
        }
        SignalPayload::Manual { reason, severity } => {
            hasher.update(reason.as_bytes());
            hasher.update(severity.as_str().as_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
