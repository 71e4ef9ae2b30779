//! Nurse triage alert engine.
//!
//! Signals flow intake -> evaluator -> store -> scheduler/dispatcher; nurses
//! answer through the response tracker. `TriageEngine` wires it together.

pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod intake;
pub mod response;
pub mod rules;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod scenario_tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchReport, RetryPolicy};
pub use engine::{EngineHandle, IntakeReport, RuleDecision, SubmitError, TriageEngine};
pub use error::TriageError;
pub use events::EngineEvent;
pub use intake::{IntakeError, SignalSubmission};
pub use rules::{RuleConfigError, RuleRegistry, RuleSet};
pub use store::AlertStore;
