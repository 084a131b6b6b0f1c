//! Error types for the escrow engine
//!
//! Every failing operation rejects the call with one of the categories
//! below and leaves no partial state behind: validation, authorization,
//! state-machine, and transfer failures are all surfaced synchronously.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input: bad lengths, amounts below the minimum, fee above
    /// the cap, duplicate roles, deposit mismatch, and the like
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller does not hold the role the operation requires
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from} -> {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// Project has been cancelled; no further mutation is accepted
    #[error("Project {0} is no longer active")]
    ProjectInactive(u64),

    /// Unknown project id or milestone index
    #[error("Not found: {0}")]
    NotFound(String),

    /// The value-transfer capability reported failure; the operation was
    /// rolled back in full and is safe to retry
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// General internal errors (invariant breaches)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an authorization error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a state transition error
    pub fn invalid_transition<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a transfer error
    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        Self::Transfer(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}
