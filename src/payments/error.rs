use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Gateway configuration incomplete: gateway={gateway}, missing={missing:?}")]
    ConfigIncomplete {
        gateway: String,
        missing: Vec<String>,
    },

    #[error("Key configuration error: {message}")]
    KeyConfigError { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Gateway call failed: gateway={gateway}, message={message}")]
    GatewayCallFailed {
        gateway: String,
        message: String,
        gateway_code: Option<String>,
        retryable: bool,
    },

    #[error("Signature invalid: gateway={gateway}, message={message}")]
    SignatureInvalid { gateway: String, message: String },

    #[error("Malformed callback: {message}")]
    MalformedCallback { message: String },

    #[error("Unsupported gateway: {0}")]
    UnsupportedGateway(String),
}

impl PaymentError {
    pub fn config_incomplete(gateway: &str, missing: &[&str]) -> Self {
        PaymentError::ConfigIncomplete {
            gateway: gateway.to_string(),
            missing: missing.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::ConfigIncomplete { .. } => false,
            PaymentError::KeyConfigError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::GatewayCallFailed { retryable, .. } => *retryable,
            PaymentError::SignatureInvalid { .. } => false,
            PaymentError::MalformedCallback { .. } => false,
            PaymentError::UnsupportedGateway(_) => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::ConfigIncomplete { .. } => 503,
            PaymentError::KeyConfigError { .. } => 503,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::GatewayCallFailed { .. } => 502,
            PaymentError::SignatureInvalid { .. } => 401,
            PaymentError::MalformedCallback { .. } => 400,
            PaymentError::UnsupportedGateway(_) => 400,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::ConfigIncomplete { gateway, .. } => {
                format!("Payment method {} is not configured", gateway)
            }
            PaymentError::KeyConfigError { .. } => {
                "Payment method is misconfigured. Please contact support".to_string()
            }
            PaymentError::NetworkError { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            PaymentError::GatewayCallFailed { .. } => {
                "Payment gateway rejected the order".to_string()
            }
            PaymentError::SignatureInvalid { .. } => "Invalid callback signature".to_string(),
            PaymentError::MalformedCallback { .. } => "Malformed callback payload".to_string(),
            PaymentError::UnsupportedGateway(name) => {
                format!("Unsupported payment method: {}", name)
            }
        }
    }
}
