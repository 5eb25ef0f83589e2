use axum::{
    routing::{get, post},
    Router,
};

pub mod health;
pub mod tasks;

/// Task endpoints (rate limited).
pub fn api_router() -> Router {
    Router::new().nest(
        "/api/v1/tasks",
        Router::new()
            .route("/process", post(tasks::process_tasks))
            .route("/batch-create", post(tasks::batch_create)),
    )
}

/// Liveness and readiness probes.
pub fn health_router() -> Router {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
}
