// ===============================
// src/error.rs
// ===============================
use hyper::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced to order/balance callers. Feed problems never end up here.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient {asset} balance: need {needed}, available {available}")]
    InsufficientBalance { asset: String, needed: Decimal, available: Decimal },

    #[error("{0} not found")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl ExchangeError {
    pub fn validation(msg: impl Into<String>) -> Self { ExchangeError::Validation(msg.into()) }

    pub fn status(&self) -> StatusCode {
        match self {
            ExchangeError::Validation(_) => StatusCode::BAD_REQUEST,
            ExchangeError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            ExchangeError::NotFound(_) => StatusCode::NOT_FOUND,
            ExchangeError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code used in JSON error bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::Validation(_) => "VALIDATION_ERROR",
            ExchangeError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            ExchangeError::NotFound(_) => "NOT_FOUND",
            ExchangeError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ExchangeError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// Message safe to return to clients; persistence details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ExchangeError::Persistence(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(e: std::io::Error) -> Self { ExchangeError::Persistence(e.to_string()) }
}
