//! Response envelope shared by every JSON endpoint.
//!
//! `{"success": bool, "message"?: string, "data"?: any, "errors"?: [string]}`

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

pub fn json_success<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(Envelope {
            success: true,
            message: None,
            data: Some(data),
            errors: None,
        }),
    )
        .into_response()
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            message: Some(message.into()),
            data: None,
            errors: None,
        }),
    )
        .into_response()
}

pub fn validation_error(errors: Vec<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(Envelope::<()> {
            success: false,
            message: Some("Validation failed".to_string()),
            data: None,
            errors: Some(errors),
        }),
    )
        .into_response()
}

pub fn invalid_json() -> Response {
    json_error(StatusCode::BAD_REQUEST, "Invalid JSON")
}
