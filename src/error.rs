//! Error types for the host-rewrite-proxy application.
//!
//! Configuration and rewrite-construction failures are modelled here.
//! Per-request filter rejections live in [`crate::access::Rejection`]; they
//! are expected outcomes, not errors.

use thiserror::Error;

/// Main error type for the host-rewrite-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// A configured or derived pattern failed to compile.
    #[error("Invalid pattern for {option}: {source}")]
    InvalidPattern {
        option: String,
        #[source]
        source: regex::Error,
    },

    /// A request was routed to a host no rewrite pattern was compiled for.
    #[error("No rewrite pattern compiled for host: {host}")]
    UnknownHost { host: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new pattern compilation error for the named option.
    pub fn invalid_pattern(option: impl Into<String>, source: regex::Error) -> Self {
        Self::InvalidPattern {
            option: option.into(),
            source,
        }
    }
}

impl From<ProxyError> for Box<pingora_core::Error> {
    fn from(e: ProxyError) -> Self {
        pingora_core::Error::explain(pingora_core::ErrorType::InternalError, e.to_string())
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
