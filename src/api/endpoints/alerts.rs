//! Alert queue and responder actions.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{parse_alert_id, ApiContext};
use crate::models::{Alert, AlertFilter, NotificationAttempt, TransitionRecord};

#[derive(Serialize)]
pub struct AlertListResponse {
    pub alerts: Vec<Alert>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct AlertDetailResponse {
    #[serde(flatten)]
    pub alert: Alert,
    /// Deadline the scheduler currently holds for this alert, if any.
    pub armed_deadline: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct AcknowledgeRequest {
    pub responder: String,
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub responder: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct ReassignRequest {
    pub actor: String,
    pub assignee: String,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("'{field}' must not be empty")));
    }
    Ok(trimmed)
}

/// `GET /api/alerts?severity=&tier=&assignee=&state=` — open alerts,
/// most severe first.
pub async fn list(
    State(ctx): State<ApiContext>,
    query: Result<Query<AlertFilter>, QueryRejection>,
) -> Result<Json<AlertListResponse>, ApiError> {
    let Query(filter) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let alerts = ctx.engine.store().list_open(&filter)?;
    let total = alerts.len();
    Ok(Json(AlertListResponse { alerts, total }))
}

/// `GET /api/alerts/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<AlertDetailResponse>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    let alert = ctx.engine.store().get(alert_id)?;
    let armed_deadline = ctx.engine.scheduler().armed(alert_id).map(|t| t.deadline);
    Ok(Json(AlertDetailResponse {
        alert,
        armed_deadline,
    }))
}

/// `GET /api/alerts/:id/history` — the audit trail, oldest first.
pub async fn history(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TransitionRecord>>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    Ok(Json(ctx.engine.store().history(alert_id)?))
}

/// `GET /api/alerts/:id/attempts`
pub async fn attempts(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<NotificationAttempt>>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    // Unknown ids are a 404, not an empty list.
    ctx.engine.store().get(alert_id)?;
    Ok(Json(ctx.engine.store().attempts_for(alert_id)?))
}

/// `POST /api/alerts/:id/acknowledge`
pub async fn acknowledge(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    payload: Result<Json<AcknowledgeRequest>, JsonRejection>,
) -> Result<Json<Alert>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    let req = body(payload)?;
    let responder = required("responder", &req.responder)?;
    Ok(Json(ctx.engine.responses().acknowledge(alert_id, responder)?))
}

/// `POST /api/alerts/:id/resolve`
pub async fn resolve(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Alert>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    let req = body(payload)?;
    let responder = required("responder", &req.responder)?;
    let notes = req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
    Ok(Json(ctx.engine.responses().resolve(alert_id, responder, notes)?))
}

/// `POST /api/alerts/:id/cancel`
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<Alert>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    let req = body(payload)?;
    let reason = required("reason", &req.reason)?;
    let alert = match req.actor.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        Some(actor) => ctx.engine.responses().cancel_as(alert_id, actor, reason)?,
        None => ctx.engine.responses().cancel(alert_id, reason)?,
    };
    Ok(Json(alert))
}

/// `POST /api/alerts/:id/reassign`
pub async fn reassign(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    payload: Result<Json<ReassignRequest>, JsonRejection>,
) -> Result<Json<Alert>, ApiError> {
    let alert_id = parse_alert_id(&id)?;
    let req = body(payload)?;
    let actor = required("actor", &req.actor)?;
    let assignee = required("assignee", &req.assignee)?;
    Ok(Json(ctx.engine.responses().reassign(alert_id, actor, assignee)?))
}
