use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use taskproc_infra::{RateDecision, RedisRateLimiter};

use crate::app::errors;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// One log line per request, tagged with a request id that is echoed back.
pub async fn request_log(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let started = Instant::now();

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Answer 408 when the handler runs past the configured timeout.
pub async fn request_timeout(
    State(timeout): State<Duration>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match tokio::time::timeout(timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
            errors::json_error(StatusCode::REQUEST_TIMEOUT, "Request timeout")
        }
    }
}

/// Per-client-IP admission control. Redis failures let the request through.
pub async fn rate_limit(
    State(limiter): State<Option<Arc<RedisRateLimiter>>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(limiter) = limiter else {
        return next.run(req).await;
    };

    let key = client_key(&req);
    let decision = match limiter.check(&key).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(error = %err, key = %key, "rate limiter unavailable, allowing request");
            return next.run(req).await;
        }
    };

    if !decision.allowed {
        let retry_secs = decision.retry_after.as_secs_f64().ceil().max(1.0) as u64;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate_limit_exceeded" })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
        insert_rate_headers(headers, &decision, decision.retry_after);
        return response;
    }

    let mut response = next.run(req).await;
    insert_rate_headers(response.headers_mut(), &decision, decision.reset_after);
    response
}

fn client_key(req: &Request<Body>) -> String {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("ip:{ip}")
}

fn insert_rate_headers(headers: &mut axum::http::HeaderMap, decision: &RateDecision, reset_in: Duration) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    if let Ok(value) = HeaderValue::from_str(&http_date(reset_in)) {
        headers.insert(RATE_LIMIT_RESET, value);
    }
}

/// RFC 1123 date `reset_in` from now, e.g. `Sun, 18 Oct 2026 10:00:00 GMT`.
fn http_date(reset_in: Duration) -> String {
    let at = Utc::now() + chrono::Duration::from_std(reset_in).unwrap_or_else(|_| chrono::Duration::zero());
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
