//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, breakers, pool, limiter)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs` / `validation.rs`: request/response DTOs and their checks
//! - `errors.rs`: the JSON response envelope

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;
pub mod validation;

use services::AppServices;

/// Build the full HTTP router.
///
/// Layers, outermost first: request log, per-request timeout, then the rate
/// limiter on the task routes only.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let limited = routes::api_router().route_layer(axum::middleware::from_fn_with_state(
        services.rate_limiter.clone(),
        middleware::rate_limit,
    ));

    Router::new()
        .merge(limited)
        .merge(routes::health_router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_log))
                .layer(axum::middleware::from_fn_with_state(
                    services.request_timeout,
                    middleware::request_timeout,
                ))
                .layer(Extension(services)),
        )
}
