//! Synchronous signal ingestion.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::triage::{IntakeReport, SignalSubmission};

/// `POST /api/signals` — evaluate one signal and report what each matching
/// rule decided. Malformed bodies are a 422, like malformed payloads.
pub async fn submit(
    State(ctx): State<ApiContext>,
    payload: Result<Json<SignalSubmission>, JsonRejection>,
) -> Result<Json<IntakeReport>, ApiError> {
    let Json(submission) =
        payload.map_err(|rejection| ApiError::MalformedSignal(rejection.body_text()))?;
    let report = ctx.engine.submit(&submission)?;
    tracing::debug!(
        signal_id = %report.signal_id,
        duplicate = report.duplicate,
        decisions = report.decisions.len(),
        "Signal accepted over HTTP"
    );
    Ok(Json(report))
}
