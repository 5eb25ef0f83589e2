use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode};

use crate::app::services::AppServices;

pub async fn live(Extension(services): Extension<Arc<AppServices>>) -> (StatusCode, &'static str) {
    if services.lifecycle.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    (StatusCode::OK, "ok")
}

pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> (StatusCode, &'static str) {
    if services.lifecycle.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    if !services.health.ready().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready");
    }
    (StatusCode::OK, "ready")
}
