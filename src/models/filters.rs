use serde::Deserialize;

use super::enums::{AlertState, Severity};

/// Responder-facing filter over open alerts. All fields are optional and
/// combine with AND.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub tier: Option<u32>,
    pub assignee: Option<String>,
    pub state: Option<AlertState>,
}
