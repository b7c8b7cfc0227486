//! Error types and HTTP response mapping
//!
//! Each stage of the broker owns its own error enum (`VerifyError`,
//! `PolicySourceError`, `MintError`). `ApiError` is the request-level
//! classification the orchestrator maps them onto; its message is what the
//! caller sees, so it never carries stage detail.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Request-level error with HTTP status code mapping
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("{message}")]
    Unauthenticated { message: String },

    #[error("{message}")]
    Forbidden { message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Uniform rejection for every token verification failure
    pub fn unauthenticated() -> Self {
        Self::Unauthenticated {
            message: "invalid or expired token".to_string(),
        }
    }

    /// Uniform rejection for every policy denial
    pub fn forbidden() -> Self {
        Self::Forbidden {
            message: "access denied by policy".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::Unauthenticated { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::Internal { .. } => 500,
        }
    }

    /// Get the error key for this error
    pub fn error_key(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "bad_request",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::Internal { .. } => "internal_error",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            error: err.error_key().to_string(),
            message: err.to_string(),
        }
    }
}

/// Failure of an outbound call made through a platform trait
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,
}

/// Configuration could not be loaded or is invalid
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}
