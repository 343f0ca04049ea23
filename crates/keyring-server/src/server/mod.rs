//! Axum admin server: routing and request handlers.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Inject shared application state (`AppState`) into handlers.
//! - Render core errors as JSON error bodies.
//!
//! Authentication and TLS termination belong to the fronting proxy.

pub mod handlers;
pub mod router;
pub mod state;
