//! Architect generation gateway
//!
//! Runs the external agent CLI for a prompt and relays its progress and
//! final architecture document to the dashboard as a server-sent event
//! stream.

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod gate;
pub mod sequencer;
pub mod state;
pub mod supervisor;
pub mod wire;

use std::sync::Arc;

use axum::Router;

pub use state::AppState;

/// API routes bound to their state, without transport layers.
pub fn app(state: Arc<AppState>) -> Router {
    api::router().with_state(state)
}
