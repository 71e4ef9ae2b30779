use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::Signal;

/// Record that a signal was processed. Returns false when the same signal
/// fingerprint was already recorded (a replayed submission).
pub fn record_processed_signal(
    conn: &Connection,
    signal: &Signal,
    received_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processed_signals
         (fingerprint, signal_id, kind, subject_id, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            signal.fingerprint,
            signal.id.to_string(),
            signal.kind.as_str(),
            signal.subject_id,
            received_at,
        ],
    )?;
    Ok(inserted == 1)
}

/// Drop a signal's log entry so a resubmission is evaluated again.
pub fn forget_processed_signal(conn: &Connection, fingerprint: &str) -> Result<bool, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM processed_signals WHERE fingerprint = ?1",
        params![fingerprint],
    )?;
    Ok(deleted == 1)
}

/// Delete log entries received before `cutoff`. Returns the number removed.
pub fn prune_processed_signals(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM processed_signals WHERE received_at < ?1",
        params![cutoff],
    )?)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::SignalKind;
    use crate::models::SignalPayload;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 7, 0, 0).unwrap()
    }

    fn signal(fingerprint: &str) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            kind: SignalKind::AdherenceMiss,
            subject_id: "patient-4".into(),
            occurred_at: t0(),
            payload: SignalPayload::AdherenceMiss {
                prescription_id: "rx-9".into(),
                scheduled_for: None,
            },
            subject_risk: None,
            fingerprint: fingerprint.into(),
        }
    }

    #[test]
    fn replay_is_detected() {
        let conn = open_memory_database().unwrap();
        assert!(record_processed_signal(&conn, &signal("fp-1"), t0()).unwrap());
        assert!(!record_processed_signal(&conn, &signal("fp-1"), t0()).unwrap());
    }

    #[test]
    fn forgotten_signal_can_be_recorded_again() {
        let conn = open_memory_database().unwrap();
        record_processed_signal(&conn, &signal("fp-1"), t0()).unwrap();
        assert!(forget_processed_signal(&conn, "fp-1").unwrap());
        assert!(!forget_processed_signal(&conn, "fp-1").unwrap());
        assert!(record_processed_signal(&conn, &signal("fp-1"), t0()).unwrap());
    }

    #[test]
    fn prune_keeps_entries_inside_window() {
        let conn = open_memory_database().unwrap();
        record_processed_signal(&conn, &signal("old"), t0()).unwrap();
        record_processed_signal(&conn, &signal("recent"), t0() + Duration::days(6)).unwrap();

        let removed = prune_processed_signals(&conn, t0() + Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(record_processed_signal(&conn, &signal("old"), t0()).unwrap());
        assert!(!record_processed_signal(&conn, &signal("recent"), t0()).unwrap());
    }
}
