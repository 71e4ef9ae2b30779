//! Active rule set inspection and hot reload.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::triage::RuleSet;

#[derive(Serialize)]
pub struct ReloadResponse {
    pub version: u64,
}

/// `GET /api/rules`
pub async fn current(State(ctx): State<ApiContext>) -> Result<Json<RuleSet>, ApiError> {
    let set = ctx.engine.rules().current();
    Ok(Json(RuleSet::clone(&set)))
}

/// `POST /api/rules/reload` — re-read the rules file. Only a strictly newer
/// version is installed.
pub async fn reload(State(ctx): State<ApiContext>) -> Result<Json<ReloadResponse>, ApiError> {
    let version = ctx.engine.rules().reload()?;
    tracing::info!(version, "Rules reloaded over HTTP");
    Ok(Json(ReloadResponse { version }))
}
