use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::utils::format_retry_message;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Store call timed out")]
    StoreTimeout,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Unknown limit type: {0}")]
    InvalidLimitType(String),

    // Policy outcomes surfaced through handlers
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        retry_after: u64,
        block_level: Option<u32>,
    },

    // Authorization errors
    #[error("Unauthorized access")]
    Unauthorized,
    #[error("Forbidden access")]
    Forbidden,

    // General errors
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, user_message) = match &self {
            // Store errors - never leak infrastructure details
            AppError::StoreUnavailable(msg) => {
                tracing::error!("Store error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable".to_string())
            }
            AppError::StoreTimeout => {
                tracing::error!("Store call timed out");
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable".to_string())
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::ConfigurationError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::InvalidLimitType(name) => {
                (StatusCode::BAD_REQUEST, format!("Unknown limit type: {}", name))
            }
            AppError::RateLimited { retry_after, block_level } => {
                let mut body = json!({
                    "error": "Rate limit exceeded",
                    "message": format_retry_message(*retry_after),
                    "retryAfter": retry_after,
                });
                if let Some(level) = block_level {
                    body["blockLevel"] = json!(level);
                }
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
                return response;
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Access denied".to_string()),
            AppError::NotFound(resource) => (StatusCode::NOT_FOUND, format!("{} not found", resource)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "message": user_message,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

impl AppError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Create an internal server error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalServerError(msg.into())
    }

    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// True for faults of the backing stores rather than of the caller
    pub fn is_store_fault(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_) | AppError::StoreTimeout)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::StoreTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_rate_limited_renders_retry_contract() {
        let response = AppError::RateLimited { retry_after: 60, block_level: Some(0) }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["blockLevel"], 0);
        assert_eq!(body["error"], "Rate limit exceeded");
    }

    #[tokio::test]
    async fn test_store_errors_do_not_leak_details() {
        let response = AppError::store("redis://:hunter2@10.0.0.5 refused").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("hunter2"));
    }
}
