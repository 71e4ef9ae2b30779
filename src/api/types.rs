//! Shared types for the responder API layer.

use std::sync::Arc;

use uuid::Uuid;

use crate::api::error::ApiError;
use crate::triage::TriageEngine;

/// Shared context for all API routes.
#[derive(Clone)]
pub struct ApiContext {
    pub engine: Arc<TriageEngine>,
}

impl ApiContext {
    pub fn new(engine: Arc<TriageEngine>) -> Self {
        Self { engine }
    }
}

/// Parse an alert id taken from the path.
pub fn parse_alert_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid alert id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_alert_id_rejects_garbage() {
        assert!(parse_alert_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_alert_id(&id.to_string()).unwrap(), id);
    }
}
