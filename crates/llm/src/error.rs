use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit open for {model}, retry in {retry_in:?}")]
    CircuitOpen { model: String, retry_in: Duration },
    #[error("unsalvageable response: {0}")]
    ResponseShape(String),
    #[error("response failed validation: {0}")]
    Validator(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transient errors are retried with backoff and count toward the
    /// circuit breaker; validation-class errors do neither.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) => true,
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_server_errors_are_transient() {
        assert!(LlmError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(LlmError::Api { status: 503, body: String::new() }.is_transient());
        assert!(LlmError::Api { status: 429, body: String::new() }.is_transient());
    }

    #[test]
    fn validation_class_errors_are_not_transient() {
        assert!(!LlmError::ResponseShape("x".into()).is_transient());
        assert!(!LlmError::Validator("x".into()).is_transient());
        assert!(!LlmError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!LlmError::Cancelled.is_transient());
    }
}
