//! Error taxonomy for upstream failures and recovery outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of an upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429 or an equivalent throttling signal
    RateLimit,
    /// Request or gateway timeout
    Timeout,
    /// Connection-level failure (reset, refused, DNS)
    Network,
    /// HTTP 5xx
    ServerError,
    /// HTTP 401/403
    AuthError,
    /// Any other HTTP 4xx
    ClientError,
    /// Could not be classified
    Unknown,
}

impl ErrorKind {
    /// All kinds, in a stable order
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::RateLimit,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::ServerError,
        ErrorKind::AuthError,
        ErrorKind::ClientError,
        ErrorKind::Unknown,
    ];

    /// Check if a failure of this kind is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::RateLimit
            | ErrorKind::Timeout
            | ErrorKind::Network
            | ErrorKind::ServerError
            | ErrorKind::Unknown => true,
            ErrorKind::AuthError | ErrorKind::ClientError => false,
        }
    }

    /// Check if a failure of this kind says something about upstream health
    ///
    /// A malformed request is the caller's problem, so it never counts toward
    /// opening the circuit.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, ErrorKind::ClientError)
    }

    /// Classify an HTTP status code. Returns `None` for non-error statuses.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(ErrorKind::RateLimit),
            401 | 403 => Some(ErrorKind::AuthError),
            408 | 504 => Some(ErrorKind::Timeout),
            500..=599 => Some(ErrorKind::ServerError),
            400..=499 => Some(ErrorKind::ClientError),
            _ => None,
        }
    }

    /// Classify a free-form error message by pattern
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("429")
            || msg.contains("rate limit")
            || msg.contains("ratelimit")
            || msg.contains("too many requests")
            || msg.contains("throttl")
        {
            ErrorKind::RateLimit
        } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("etimedout")
        {
            ErrorKind::Timeout
        } else if msg.contains("401")
            || msg.contains("403")
            || msg.contains("unauthorized")
            || msg.contains("forbidden")
        {
            ErrorKind::AuthError
        } else if msg.contains("connection")
            || msg.contains("econnreset")
            || msg.contains("econnrefused")
            || msg.contains("enotfound")
            || msg.contains("socket hang up")
            || msg.contains("network")
        {
            ErrorKind::Network
        } else if msg.contains("500")
            || msg.contains("502")
            || msg.contains("503")
            || msg.contains("internal server error")
            || msg.contains("service unavailable")
            || msg.contains("bad gateway")
        {
            ErrorKind::ServerError
        } else {
            ErrorKind::Unknown
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::ServerError => "server_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed attempt against the upstream
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    /// Classified kind
    pub kind: ErrorKind,
    /// Human-readable reason
    pub message: String,
    /// HTTP status, if the upstream answered
    pub status: Option<u16>,
    /// Server-advertised wait before retrying
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    /// Create an error with an explicit kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Create an error from an HTTP status, falling back to message patterns
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ErrorKind::from_status(status).unwrap_or_else(|| ErrorKind::from_message(&message));
        Self {
            kind,
            message,
            status: Some(status),
            retry_after: None,
        }
    }

    /// Create an error classified purely from its message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    /// Attach a retry-after hint
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, service unavailable (probe in {retry_in:?})")]
    CircuitOpen {
        /// Time until the breaker allows a probe
        retry_in: Duration,
        /// Attempts made before the rejection
        attempts: u32,
    },

    /// Single failed attempt, not yet routed through the retry loop
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Failure that can never succeed unmodified
    #[error("Non-retryable {} error after {attempts} attempt(s): {}", .last.kind, .last.message)]
    NonRetryable { attempts: u32, last: UpstreamError },

    /// Maximum retries exceeded
    #[error("Retries exhausted after {attempts} attempt(s), last {} error: {}", .last.kind, .last.message)]
    Exhausted { attempts: u32, last: UpstreamError },
}

impl ResilienceError {
    /// Check if this error is transient and can be retried later
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. } => true,
            ResilienceError::Upstream(e) => e.kind.is_retryable(),
            ResilienceError::Exhausted { last, .. } => last.kind.is_retryable(),
            ResilienceError::NonRetryable { .. } => false,
        }
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. } => false,
            ResilienceError::Upstream(e) => e.kind.trips_breaker(),
            ResilienceError::NonRetryable { last, .. } | ResilienceError::Exhausted { last, .. } => {
                last.kind.trips_breaker()
            }
        }
    }

    /// Number of upstream attempts made before this error surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::CircuitOpen { attempts, .. }
            | ResilienceError::NonRetryable { attempts, .. }
            | ResilienceError::Exhausted { attempts, .. } => *attempts,
            ResilienceError::Upstream(_) => 1,
        }
    }

    /// Kind of the last upstream failure, if there was one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ResilienceError::CircuitOpen { .. } => None,
            ResilienceError::Upstream(e) => Some(e.kind),
            ResilienceError::NonRetryable { last, .. } | ResilienceError::Exhausted { last, .. } => {
                Some(last.kind)
            }
        }
    }

    /// Check if this is a circuit-open rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(429), Some(ErrorKind::RateLimit));
        assert_eq!(ErrorKind::from_status(401), Some(ErrorKind::AuthError));
        assert_eq!(ErrorKind::from_status(403), Some(ErrorKind::AuthError));
        assert_eq!(ErrorKind::from_status(404), Some(ErrorKind::ClientError));
        assert_eq!(ErrorKind::from_status(504), Some(ErrorKind::Timeout));
        assert_eq!(ErrorKind::from_status(503), Some(ErrorKind::ServerError));
        assert_eq!(ErrorKind::from_status(200), None);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(ErrorKind::from_message("socket hang up"), ErrorKind::Network);
        assert_eq!(ErrorKind::from_message("ECONNRESET"), ErrorKind::Network);
        assert_eq!(ErrorKind::from_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(
            ErrorKind::from_message("Too Many Requests"),
            ErrorKind::RateLimit
        );
        assert_eq!(ErrorKind::from_message("weird"), ErrorKind::Unknown);
    }

    #[test]
    fn test_retryability() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::ClientError.trips_breaker());
        assert!(ErrorKind::AuthError.trips_breaker());
    }

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Upstream(UpstreamError::from_message("network down"));
        assert!(transient.is_transient());
        assert!(transient.should_trip_breaker());

        let permanent = ResilienceError::NonRetryable {
            attempts: 1,
            last: UpstreamError::from_status(401, "bad token"),
        };
        assert!(permanent.is_permanent());
        assert_eq!(permanent.attempts(), 1);
        assert_eq!(permanent.kind(), Some(ErrorKind::AuthError));

        let circuit_open = ResilienceError::CircuitOpen {
            retry_in: Duration::from_secs(1),
            attempts: 0,
        };
        assert!(circuit_open.is_circuit_open());
        assert!(!circuit_open.should_trip_breaker());
        assert_eq!(circuit_open.kind(), None);
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = ResilienceError::Exhausted {
            attempts: 4,
            last: UpstreamError::from_status(503, "unavailable"),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 4 attempt(s), last server_error error: unavailable"
        );
    }
}
