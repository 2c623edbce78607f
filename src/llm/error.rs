//! LLM error classification and transport retry policy.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the provider.
    RateLimited,
    /// 5xx from the provider.
    ServerError,
    /// 4xx other than 429 and context-length rejections.
    ClientError,
    /// The prompt did not fit the model's context window.
    ContextLength,
    /// Connection, DNS or timeout failure.
    Network,
    /// Response body was not what the API promised.
    Parse,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::ContextLength => "context_length",
            Self::Network => "network",
            Self::Parse => "parse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: String, status: Option<u16>) -> Self {
        Self {
            kind,
            message,
            status,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message, Some(429))
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ServerError, message, Some(status))
    }

    pub fn client_error(status: u16, message: String) -> Self {
        if is_context_length_message(&message) {
            return Self::new(LlmErrorKind::ContextLength, message, Some(status));
        }
        Self::new(LlmErrorKind::ClientError, message, Some(status))
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::Network, message, None)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::Parse, message, None)
    }

    pub fn is_context_length(&self) -> bool {
        self.kind == LlmErrorKind::ContextLength
    }

    /// Delay before retry `attempt` (0-based): Retry-After when present,
    /// otherwise exponential backoff starting at one second.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(after) = self.retry_after {
            return after;
        }
        let base = match self.kind {
            LlmErrorKind::RateLimited => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        };
        base.saturating_mul(2u32.saturating_pow(attempt.min(5)))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {}): {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Map an HTTP status to the kind of failure it represents.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

fn is_context_length_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length_exceeded") || lower.contains("maximum context length")
}

/// Transport-level retries inside one LLM call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_retry_duration: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError) -> bool {
        matches!(
            error.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::Network
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_context_length_detection() {
        let err = LlmError::client_error(
            400,
            r#"{"error":{"code":"context_length_exceeded"}}"#.to_string(),
        );
        assert!(err.is_context_length());

        let err = LlmError::client_error(400, "bad request".to_string());
        assert!(!err.is_context_length());
    }

    #[test]
    fn test_should_retry_transient_only() {
        let config = RetryConfig::default();
        assert!(config.should_retry(&LlmError::server_error(502, String::new())));
        assert!(config.should_retry(&LlmError::network_error("reset".into())));
        assert!(!config.should_retry(&LlmError::client_error(401, "no key".into())));
        assert!(!config.should_retry(&LlmError::parse_error("junk".into())));
    }

    #[test]
    fn test_retry_after_wins_over_backoff() {
        let err = LlmError::rate_limited("slow down".into(), Some(Duration::from_secs(7)));
        assert_eq!(err.suggested_delay(3), Duration::from_secs(7));

        let err = LlmError::server_error(500, String::new());
        assert_eq!(err.suggested_delay(0), Duration::from_secs(1));
        assert_eq!(err.suggested_delay(2), Duration::from_secs(4));
    }
}
