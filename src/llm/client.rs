//! The external model boundary.
//!
//! Everything past [`ModelClient::generate`] is treated as an opaque,
//! possibly slow and possibly unreliable remote service.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from a model provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Cannot connect to {0}")]
    Connection(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Authentication failed ({status})")]
    Auth { status: u16 },

    #[error("Request rejected {status}: {message}")]
    BadRequest { status: u16, message: String },

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Failed to parse provider response: {0}")]
    MalformedResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl ModelError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Timeout(_)
            | ModelError::RateLimited { .. }
            | ModelError::Connection(_)
            | ModelError::Server { .. }
            | ModelError::MalformedResponse(_)
            | ModelError::Http(_) => true,
            ModelError::Auth { .. } | ModelError::BadRequest { .. } | ModelError::QuotaExhausted(_) => {
                false
            }
        }
    }

    /// Provider-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Map a non-success HTTP status to a typed error.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> ModelError {
    let message: String = body.chars().take(500).collect();
    match status {
        401 | 403 => ModelError::Auth { status },
        408 => ModelError::Server { status, message },
        429 if body.contains("exceeded your current quota") => ModelError::QuotaExhausted(message),
        429 => ModelError::RateLimited { retry_after },
        500..=599 => ModelError::Server { status, message },
        _ => ModelError::BadRequest { status, message },
    }
}

/// Map a transport error from `reqwest`.
pub fn classify_transport(err: &reqwest::Error, endpoint: &str, timeout: Duration) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(timeout)
    } else if err.is_connect() {
        ModelError::Connection(endpoint.to_string())
    } else {
        ModelError::Http(err.to_string())
    }
}

/// Read the `retry-after` header in whole seconds.
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// A generative model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one prompt and return the raw completion text.
    async fn generate(&self, prompt: &str, model_id: &str) -> Result<String, ModelError>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, "", None), ModelError::Auth { status: 401 });
        assert!(!classify_status(403, "", None).is_transient());
        assert!(!classify_status(400, "bad json", None).is_transient());
        assert!(classify_status(503, "overloaded", None).is_transient());
        assert!(classify_status(408, "", None).is_transient());

        let limited = classify_status(429, "slow down", Some(Duration::from_secs(3)));
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        let quota = classify_status(429, "You exceeded your current quota", None);
        assert!(matches!(quota, ModelError::QuotaExhausted(_)));
        assert!(!quota.is_transient());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        match classify_status(500, &body, None) {
            ModelError::Server { message, .. } => assert_eq!(message.len(), 500),
            other => panic!("expected Server, got {:?}", other),
        }
    }
}
