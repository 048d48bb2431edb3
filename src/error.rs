//! Error types for protected calls, configuration, and the message bus.
//!
//! Classification drives the retrier: transport failures, bad statuses, and attempt
//! timeouts are retried; rejections, aborted tasks, and configuration problems are not.
use std::fmt;
use std::time::Duration;

/// Why a breaker refused to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The breaker is open (or half-open with its single probe already in flight).
    CircuitOpen {
        /// Time since the breaker last opened.
        open_for: Duration,
    },
    /// The dependency's concurrency limit is reached.
    MaxConcurrency {
        /// Calls currently in flight.
        in_flight: usize,
        /// Configured cap.
        max: usize,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { open_for } => {
                write!(f, "circuit open (opened {:?} ago)", open_for)
            }
            Self::MaxConcurrency { in_flight, max } => {
                write!(f, "max concurrency reached ({} in-flight, max {})", in_flight, max)
            }
        }
    }
}

/// Failure of a protected outbound call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Connection-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The dependency answered with a status of 299 or above.
    #[error("status was {status}")]
    Status {
        /// HTTP status returned by the dependency.
        status: u16,
    },
    /// An attempt, or the call as a whole, exceeded its deadline.
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout {
        /// Time spent before giving up.
        elapsed: Duration,
        /// Configured limit.
        timeout: Duration,
    },
    /// The breaker refused the call.
    #[error("call rejected: {0}")]
    Rejected(Rejection),
    /// The protected task panicked or was cancelled.
    #[error("protected task aborted: {0}")]
    Aborted(String),
    /// The breaker's configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CallError {
    /// Whether the retrier should try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. } | Self::Timeout { .. })
    }

    /// Check if this error is due to a breaker rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Check if this error is due to a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Access the rejection reason if present.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Rejected(r) => Some(*r),
            _ => None,
        }
    }

    /// Access the failing status code if present.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration failures. These indicate a mismatch between code and configuration and
/// are expected to abort startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A tuning property outside the known set was requested.
    #[error("unknown breaker property '{property}'")]
    UnknownProperty {
        /// Name that was requested.
        property: String,
    },
    /// A configured value could not be interpreted.
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value found.
        value: String,
    },
    /// A resolved configuration failed validation.
    #[error("invalid breaker configuration for '{name}': {reason}")]
    Invalid {
        /// Dependency name.
        name: String,
        /// What was wrong.
        reason: String,
    },
    /// A configuration file could not be read.
    #[error("failed to read '{path}': {message}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error text.
        message: String,
    },
    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Failure to hand a payload to the message bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The bus refused or failed the publish.
    #[error("publish to '{topic}' failed: {message}")]
    Failed {
        /// Destination topic.
        topic: String,
        /// Underlying error text.
        message: String,
    },
    /// The payload could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// The publish did not complete in time.
    #[error("publish to '{topic}' timed out after {timeout:?}")]
    Timeout {
        /// Destination topic.
        topic: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn retryable_classification() {
        assert!(CallError::Transport("refused".into()).is_retryable());
        assert!(CallError::Status { status: 500 }.is_retryable());
        assert!(CallError::Timeout {
            elapsed: Duration::from_millis(10),
            timeout: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(!CallError::Rejected(Rejection::MaxConcurrency { in_flight: 1, max: 1 })
            .is_retryable());
        assert!(!CallError::Aborted("panic".into()).is_retryable());
        assert!(!CallError::Config(ConfigError::Parse("x".into())).is_retryable());
    }

    #[test]
    fn status_error_display() {
        let err = CallError::Status { status: 503 };
        assert_eq!(err.to_string(), "status was 503");
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn rejection_display_and_accessor() {
        let err = CallError::Rejected(Rejection::MaxConcurrency { in_flight: 10, max: 10 });
        let msg = err.to_string();
        assert!(msg.contains("max concurrency"));
        assert!(msg.contains("10"));
        assert!(err.is_rejected());
        assert_eq!(err.rejection(), Some(Rejection::MaxConcurrency { in_flight: 10, max: 10 }));

        let open = Rejection::CircuitOpen { open_for: Duration::from_secs(2) };
        assert!(open.to_string().contains("circuit open"));
    }

    #[test]
    fn config_error_is_transparent_source() {
        let err = CallError::from(ConfigError::UnknownProperty { property: "Foo".into() });
        assert_eq!(err.to_string(), "unknown breaker property 'Foo'");
        assert!(err.source().is_none());
    }

    #[test]
    fn timeout_display_includes_durations() {
        let err = CallError::Timeout {
            elapsed: Duration::from_millis(1100),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("1.1"));
    }
}
