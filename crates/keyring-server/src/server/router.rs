//! Axum router construction.

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, state::AppState};

/// Per-request timeout. Rotation waits on one KMS round-trip and one
/// transaction; re-wrap work happens outside the request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tenants/:tenant/tmk", post(handlers::create_tmk))
        .route("/tenants/:tenant/tmk/rotate", post(handlers::rotate_tmk))
        .route("/tenants/:tenant/tmk/status", get(handlers::tmk_status))
        .route("/tenants/:tenant/tmk/export", post(handlers::export_tmk))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
