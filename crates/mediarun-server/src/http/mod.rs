//! HTTP API.
//!
//! Provides endpoints for:
//! - Task submission (`POST /v1/{endpoint}`)
//! - Task polling and cancellation (`/v1/tasks/{id}`)
//! - Caller balance (`/v1/organization`)
//! - Input uploads (`/v1/uploads`)
//! - Key management and pool diagnostics (`/v1/admin/*`)
//! - Generated outputs (`/outputs/*`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

mod extract;
mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let outputs = ServeDir::new(&engine.config().outputs_dir);

    Router::new()
        // API routes
        .route("/v1/tasks/:id", get(handlers::get_task).delete(handlers::cancel_task))
        .route("/v1/organization", get(handlers::organization))
        .route("/v1/uploads", post(handlers::create_upload))
        .route("/v1/uploads/:name", put(handlers::receive_upload))
        .route("/v1/:endpoint", post(handlers::submit_task))
        // Admin routes
        .route(
            "/v1/admin/keys",
            get(handlers::list_keys).post(handlers::create_key),
        )
        .route("/v1/admin/pool", get(handlers::pool_status))
        // Artifacts
        .nest_service("/outputs", outputs)
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}
