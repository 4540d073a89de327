//! Application-level error type for the HTTP surface
//!
//! Wraps the service errors with request context and maps them to HTTP
//! status codes, machine-readable error codes and user-facing messages.

use crate::payments::error::PaymentError;
use crate::services::order_lifecycle::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidAmount,
    ValidationError,
    Unauthorized,
    Forbidden,
    OrderNotFound,
    UnsupportedGateway,
    GatewayNotConfigured,
    PaymentProviderError,
    SignatureInvalid,
    MalformedCallback,
    CreditFailed,
    DatabaseError,
    InternalError,
}

#[derive(Debug)]
pub enum AppErrorKind {
    /// No usable caller identity on the request
    Unauthorized { message: String },
    /// Request body or query failed validation before reaching a service
    Validation { field: String, message: String },
    Lifecycle(LifecycleError),
}

/// Unified application error type
#[derive(Debug)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Unauthorized {
            message: message.into(),
        })
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation {
            field: field.into(),
            message: message.into(),
        })
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Unauthorized { .. } => 401,
            AppErrorKind::Validation { .. } => 400,
            AppErrorKind::Lifecycle(err) => err.http_status_code(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppErrorKind::Validation { .. } => ErrorCode::ValidationError,
            AppErrorKind::Lifecycle(err) => match err {
                LifecycleError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                LifecycleError::Payment(p) | LifecycleError::GatewayFailed { source: p, .. } => {
                    payment_error_code(p)
                }
                LifecycleError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                LifecycleError::Forbidden { .. } => ErrorCode::Forbidden,
                LifecycleError::SignatureInvalid { .. } => ErrorCode::SignatureInvalid,
                LifecycleError::CreditFailed { .. } => ErrorCode::CreditFailed,
                LifecycleError::Database(_) => ErrorCode::DatabaseError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Unauthorized { message } => message.clone(),
            AppErrorKind::Validation { field, message } => {
                format!("Invalid {}: {}", field, message)
            }
            AppErrorKind::Lifecycle(err) => err.user_message(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Lifecycle(err) => err.is_retryable(),
            _ => false,
        }
    }
}

fn payment_error_code(err: &PaymentError) -> ErrorCode {
    match err {
        PaymentError::ValidationError { .. } => ErrorCode::ValidationError,
        PaymentError::ConfigIncomplete { .. } | PaymentError::KeyConfigError { .. } => {
            ErrorCode::GatewayNotConfigured
        }
        PaymentError::NetworkError { .. } | PaymentError::GatewayCallFailed { .. } => {
            ErrorCode::PaymentProviderError
        }
        PaymentError::SignatureInvalid { .. } => ErrorCode::SignatureInvalid,
        PaymentError::MalformedCallback { .. } => ErrorCode::MalformedCallback,
        PaymentError::UnsupportedGateway(_) => ErrorCode::UnsupportedGateway,
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AppErrorKind::Lifecycle(err) => write!(f, "{}", err),
            _ => write!(f, "{}", self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        AppError::new(AppErrorKind::Lifecycle(err))
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::new(AppErrorKind::Lifecycle(LifecycleError::Payment(err)))
    }
}

pub type AppResult<T> = Result<T, AppError>;
