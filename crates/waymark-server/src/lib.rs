//! waymark-server - REST API server for waymark.
//!
//! A thin JSON layer over [`waymark_core::ElementService`].
//!
//! # Example
//!
//! ```ignore
//! use waymark_core::{ElementService, EngineConfig};
//! use waymark_server::{create_server, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ElementService::open(EngineConfig::default()).unwrap();
//!     let app = create_server(AppState::new(service));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use middleware::{SequencePoint, SEQUENCE_HEADER};
pub use state::AppState;

use axum::{middleware as axum_middleware, Router};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::Level;

/// Create the server with all routes and middleware.
pub fn create_server(state: AppState) -> Router {
    routes::create_router(state)
        .layer(axum_middleware::from_fn(middleware::sequence_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(middleware::request_span)
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .layer(middleware::cors_layer())
}
