/*!
 * Error types for Pacekeeper
 */

use std::fmt;
use std::io;
use std::time::Duration;

use pacekeeper_core_resilience::{ErrorKind, ResilienceError};

pub type Result<T> = std::result::Result<T, GovernorError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum GovernorError {
    /// Configuration error
    Config(String),

    /// Circuit breaker is open; the upstream is considered down
    ServiceUnavailable { retry_in: Duration, attempts: u32 },

    /// The upstream failed and recovery gave up
    Upstream {
        kind: ErrorKind,
        message: String,
        status: Option<u16>,
        attempts: u32,
    },

    /// I/O error
    Io(io::Error),

    /// Generic error with message
    Other(String),
}

impl GovernorError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // Fatal errors: nothing ran or nothing can run
            GovernorError::Config(_) | GovernorError::Io(_) => EXIT_FATAL,
            GovernorError::Upstream { kind, .. } if *kind == ErrorKind::AuthError => EXIT_FATAL,
            // Everything else: partial failure
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if a failed item is worth another attempt
    ///
    /// Circuit-open rejections are retryable: the circuit will close again.
    /// Free-form messages are classified by pattern.
    pub fn is_retryable(&self) -> bool {
        match self {
            GovernorError::ServiceUnavailable { .. } => true,
            GovernorError::Upstream { kind, .. } => kind.is_retryable(),
            GovernorError::Io(io_err) => Self::is_io_transient(io_err),
            GovernorError::Other(msg) => matches!(
                ErrorKind::from_message(msg),
                ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Network | ErrorKind::ServerError
            ),
            GovernorError::Config(_) => false,
        }
    }

    /// Check if an I/O error is transient
    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
        )
    }

    /// Check if this error is an upstream rate-limit rejection
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            GovernorError::Upstream {
                kind: ErrorKind::RateLimit,
                ..
            }
        )
    }

    /// Check if this error is a circuit-open rejection
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, GovernorError::ServiceUnavailable { .. })
    }

    /// Upstream error kind, if the upstream was reached
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GovernorError::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Attempts made against the upstream before this error
    pub fn attempts(&self) -> u32 {
        match self {
            GovernorError::ServiceUnavailable { attempts, .. }
            | GovernorError::Upstream { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernorError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            GovernorError::ServiceUnavailable { retry_in, attempts } => {
                write!(
                    f,
                    "Service unavailable: circuit open, retry in {}ms ({} attempt(s) made)",
                    retry_in.as_millis(),
                    attempts
                )
            }
            GovernorError::Upstream {
                kind,
                message,
                status,
                attempts,
            } => {
                write!(f, "Upstream {} error", kind)?;
                if let Some(status) = status {
                    write!(f, " (HTTP {})", status)?;
                }
                write!(f, " after {} attempt(s): {}", attempts, message)
            }
            GovernorError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            GovernorError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for GovernorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GovernorError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResilienceError> for GovernorError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen { retry_in, attempts } => {
                GovernorError::ServiceUnavailable { retry_in, attempts }
            }
            ResilienceError::Upstream(last) => GovernorError::Upstream {
                kind: last.kind,
                message: last.message,
                status: last.status,
                attempts: 1,
            },
            ResilienceError::NonRetryable { attempts, last }
            | ResilienceError::Exhausted { attempts, last } => GovernorError::Upstream {
                kind: last.kind,
                message: last.message,
                status: last.status,
                attempts,
            },
        }
    }
}

impl From<io::Error> for GovernorError {
    fn from(err: io::Error) -> Self {
        GovernorError::Io(err)
    }
}

impl From<serde_json::Error> for GovernorError {
    fn from(err: serde_json::Error) -> Self {
        GovernorError::Config(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for GovernorError {
    fn from(err: toml::de::Error) -> Self {
        GovernorError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for GovernorError {
    fn from(err: toml::ser::Error) -> Self {
        GovernorError::Config(format!("TOML serialize error: {}", err))
    }
}
