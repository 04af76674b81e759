//! Error types for Turnstile.

use std::fmt;

use thiserror::Error;

/// Why a caller gave up on a pending wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's deadline passed before admission.
    DeadlineExceeded,
    /// The caller aborted the wait explicitly.
    Aborted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Aborted => write!(f, "aborted by caller"),
        }
    }
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The admission check declined the request
    #[error("Rate limit exceeded{}", for_key(.key))]
    RateLimitExceeded {
        /// The key whose quota was exhausted, if the limiter is keyed
        key: Option<String>,
    },

    /// The caller's cancellation fired before the limiter admitted the request
    #[error("Wait canceled: {0}")]
    Canceled(CancelReason),

    /// The limiter was stopped while the request was pending
    #[error("Rate limiter shut down")]
    Shutdown,

    /// A keyed limiter was asked to admit a request without a key
    #[error("Admission key is required for a keyed limiter")]
    MissingKey,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background task errors
    #[error("Background task error: {0}")]
    Task(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error is an admission outcome rather than an operational failure.
    ///
    /// Rejections are always recoverable: the request is turned away, the process carries on.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TurnstileError::RateLimitExceeded { .. }
                | TurnstileError::Canceled(_)
                | TurnstileError::Shutdown
        )
    }
}

fn for_key(key: &Option<String>) -> String {
    key.as_ref().map(|k| format!(" for {}", k)).unwrap_or_default()
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
