//! Route definitions for the REST API.

mod diff;
mod elements;
mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Element reads
        .route("/api/elements", get(elements::get_elements))
        .route("/api/element/:type/:id", get(elements::get_element))
        .route("/api/element/:type/:id/history", get(elements::get_history))
        .route(
            "/api/element/:type/:id/history/:version",
            get(elements::get_element_version),
        )
        .route("/api/element/:type/:id/parents", get(elements::get_parents))
        // Writes
        .route("/api/diff", post(diff::submit_diff))
        // Attach state
        .with_state(state)
}

pub use diff::*;
pub use elements::*;
pub use health::*;
