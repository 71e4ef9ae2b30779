//! Responder API router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//! Routes are nested under `/api/` and every request is traced.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::triage::TriageEngine;

/// Build the responder API router.
pub fn api_router(engine: Arc<TriageEngine>) -> Router {
    build_router(ApiContext::new(engine))
}

fn build_router(ctx: ApiContext) -> Router {
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/alerts", get(endpoints::alerts::list))
        .route("/alerts/:id", get(endpoints::alerts::detail))
        .route("/alerts/:id/history", get(endpoints::alerts::history))
        .route("/alerts/:id/attempts", get(endpoints::alerts::attempts))
        .route("/alerts/:id/acknowledge", post(endpoints::alerts::acknowledge))
        .route("/alerts/:id/resolve", post(endpoints::alerts::resolve))
        .route("/alerts/:id/cancel", post(endpoints::alerts::cancel))
        .route("/alerts/:id/reassign", post(endpoints::alerts::reassign))
        .route("/rules", get(endpoints::rules::current))
        .route("/rules/reload", post(endpoints::rules::reload))
        .route("/signals", post(endpoints::signals::submit))
        .with_state(ctx);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
