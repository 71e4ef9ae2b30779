//! Responder HTTP API.
//!
//! Nurses and care coordinators read the open-alert queue and drive alerts
//! through acknowledge, resolve, cancel and reassign. Collaborators may post
//! signals here for a synchronous decision. Routes are nested under `/api/`.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer};
pub use types::ApiContext;
