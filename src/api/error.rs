use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::TradeError;

/// Error returned by HTTP handlers; renders as a JSON body with a status
/// derived from the trade error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Trade(err) => match err {
                TradeError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
                TradeError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string()),
                TradeError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", err.to_string()),
                TradeError::InvalidState(_) => (StatusCode::BAD_REQUEST, "INVALID_STATE", err.to_string()),
                TradeError::ValidationFailed(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_FAILED", err.to_string())
                }
                TradeError::LockExpired { .. } => (StatusCode::BAD_REQUEST, "LOCK_EXPIRED", err.to_string()),
                TradeError::MaxExtensionsReached { .. } => {
                    (StatusCode::BAD_REQUEST, "MAX_EXTENSIONS_REACHED", err.to_string())
                }
                TradeError::Conflict { book_id, expires_at } => {
                    let body = json!({
                        "error": err.to_string(),
                        "code": "CONFLICT",
                        "lockedBookId": book_id,
                        "lockExpiresAt": expires_at,
                    });
                    return (StatusCode::CONFLICT, Json(body)).into_response();
                }
                TradeError::TransferFailed { trade_id } => {
                    tracing::error!(trade_id = %trade_id, "transfer failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "TRANSFER_FAILED",
                        err.to_string(),
                    )
                }
                TradeError::Store(store_err) => {
                    tracing::error!(error = %store_err, "storage error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}
