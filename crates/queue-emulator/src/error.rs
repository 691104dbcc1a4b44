//! Error types for broker operations.
//!
//! Expected outcomes are values, not errors: an empty receive after the wait
//! deadline, a `complete` on an unknown or expired token, and "no session
//! available" are all normal return values. The variants here cover caller
//! misuse (stale capabilities, malformed input) and cancellation.

use thiserror::Error;

/// Error type for all broker-core operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A session-enabled entity was given an envelope without a session key.
    /// Raised at enqueue time, never at delivery time.
    #[error("Queue '{queue}' requires a session id on every envelope")]
    SessionIdMissing { queue: String },

    /// An operation required a valid session lock, but the presented lock
    /// has expired or been superseded.
    #[error("Session lock lost for session '{session_id}'")]
    SessionLockLost { session_id: String },

    /// An operation required a valid message lock token, but the token is
    /// unknown or its lock has expired.
    #[error("Message lock lost for token '{token}'")]
    MessageLockLost { token: String },

    /// The caller-supplied cancellation signal fired while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
