use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("not found: {what}")]
    NotFound { what: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("insufficient funds: balance={balance} required={required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("rate limit exceeded: {limit}")]
    RateLimitExceeded { limit: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Stable machine-readable code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::InvalidState { .. } => "invalid_state",
            GatewayError::InsufficientFunds { .. } => "insufficient_funds",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::Transport { .. } => "transport_error",
            GatewayError::Internal { .. } => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
