//! Error response formatting
//!
//! Every failed API call answers with the same JSON envelope:
//! `{success: false, message, error, request_id, timestamp, retryable}`.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`; shares the `success` key with the success envelopes
    pub success: bool,

    /// Human-readable error message
    pub message: String,

    /// Machine-readable error code
    pub error: ErrorCode,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// ISO 8601 timestamp of the error
    pub timestamp: String,

    /// Whether the client should retry the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            success: false,
            message: error.user_message(),
            error: error.error_code(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(error.is_retryable()),
        }
    }

    /// Create a generic internal server error response
    pub fn internal_error(request_id: Option<String>) -> Self {
        Self {
            success: false,
            message: "An internal server error occurred. Please try again later.".to_string(),
            error: ErrorCode::InternalError,
            request_id,
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(false),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

/// Helper to extract request ID from request headers
pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::order_lifecycle::LifecycleError;

    #[test]
    fn test_error_response_from_app_error() {
        let app_error = AppError::from(LifecycleError::OrderNotFound {
            order_id: "PAY1".to_string(),
        })
        .with_request_id(Some("req_123".to_string()));

        let error_response = ErrorResponse::from_app_error(&app_error);

        assert!(!error_response.success);
        assert_eq!(error_response.error, ErrorCode::OrderNotFound);
        assert_eq!(error_response.request_id, Some("req_123".to_string()));
        assert_eq!(error_response.message, "Order not found");
    }

    #[test]
    fn test_app_error_into_response() {
        let app_error = AppError::from(LifecycleError::InvalidAmount {
            message: "amount must be greater than zero, got -1".to_string(),
        });

        let response = app_error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_internal_error_response() {
        let error = ErrorResponse::internal_error(Some("req_456".to_string()));

        assert_eq!(error.error, ErrorCode::InternalError);
        assert_eq!(error.request_id, Some("req_456".to_string()));
        assert!(error.message.contains("internal server error"));
    }

    #[test]
    fn test_request_id_header_lookup() {
        let mut headers = HeaderMap::new();
        assert_eq!(get_request_id_from_headers(&headers), None);
        headers.insert("x-request-id", "abc".parse().expect("header value"));
        assert_eq!(get_request_id_from_headers(&headers), Some("abc".to_string()));
    }
}
