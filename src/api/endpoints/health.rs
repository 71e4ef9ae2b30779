//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub rules_version: u64,
    pub armed_timers: usize,
    pub next_deadline: Option<DateTime<Utc>>,
    pub queued_notifications: usize,
}

/// `GET /api/health` — liveness plus a glance at the engine's backlog.
pub async fn check(State(ctx): State<ApiContext>) -> Result<Json<HealthResponse>, ApiError> {
    let engine = &ctx.engine;
    Ok(Json(HealthResponse {
        status: "ok",
        version: crate::config::APP_VERSION,
        rules_version: engine.rules().version(),
        armed_timers: engine.scheduler().armed_count(),
        next_deadline: engine.scheduler().next_deadline(),
        queued_notifications: engine.dispatcher().queue().len(),
    }))
}
