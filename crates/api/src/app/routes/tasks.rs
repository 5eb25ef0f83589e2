use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::Response,
    Json,
};
use tracing::error;

use crate::app::dto::{
    BatchCreateTasksRequest, BatchCreateTasksResponse, ProcessTasksRequest, ProcessTasksResponse,
};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::app::validation::Validate;

/// Parse and validate a JSON body, or produce the matching 400 response.
fn accept<T: Validate>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    let Json(body) = body.map_err(|_| errors::invalid_json())?;
    body.validate().map_err(errors::validation_error)?;
    Ok(body)
}

pub async fn process_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<ProcessTasksRequest>, JsonRejection>,
) -> Response {
    let body = match accept(body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request = body.to_domain();
    match services
        .processor
        .process_batch(&request, services.lifecycle.request_token())
        .await
    {
        Ok(summary) => errors::json_success(StatusCode::OK, ProcessTasksResponse::from(summary)),
        Err(err) => {
            error!(error = %err, limit = request.limit, "batch processing failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "Processing failed")
        }
    }
}

pub async fn batch_create(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<BatchCreateTasksRequest>, JsonRejection>,
) -> Response {
    let body = match accept(body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    match services.creator.create_tasks(body.count as usize).await {
        Ok(ids) => errors::json_success(StatusCode::OK, BatchCreateTasksResponse::from(ids)),
        Err(err) => {
            error!(
                error = %err,
                inserted = err.inserted.len(),
                "batch create failed"
            );
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create tasks")
        }
    }
}
