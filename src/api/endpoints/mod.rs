//! Responder API endpoint handlers.

pub mod alerts;
pub mod health;
pub mod rules;
pub mod signals;
