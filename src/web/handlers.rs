use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::error;

use super::AppState;
use crate::errors::{AppError, LoaderError, StorageError};
use crate::loader::Dispatch;
use crate::models::ImageRequest;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "image-loader",
        "cache_available": state.loader.store().is_available()
    }))
}

/// Submit a request or a cancellation and wait for the job's answer.
///
/// Cancelled jobs have no answer and produce `204 No Content`.
pub async fn submit_image(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> Response {
    match state.loader.handle_message(request) {
        Dispatch::Accepted(receiver) => match receiver.await {
            Ok(response) => Json(response).into_response(),
            Err(_) => StatusCode::NO_CONTENT.into_response(),
        },
        Dispatch::Cancelled => StatusCode::NO_CONTENT.into_response(),
        Dispatch::Rejected => StatusCode::FORBIDDEN.into_response(),
    }
}

pub async fn cache_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    match state.loader.store().stats().await {
        Ok(stats) => Ok(Json(json!({ "available": true, "stats": stats }))),
        Err(StorageError::Unavailable) => Ok(Json(json!({ "available": false }))),
        Err(e) => Err(LoaderError::from(e).into()),
    }
}

pub async fn worker_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stats = state
        .loader
        .worker()
        .stats()
        .await
        .ok_or_else(|| AppError::internal("image worker is not running"))?;
    Ok(Json(json!(stats)))
}
