//! Error types for the signature router

use crate::admission::AdmissionScope;
use crate::condition::ConditionError;
use crate::dispatch::ChannelAttempt;
use crate::fallback::FailureReason;
use thiserror::Error;

/// Result type for router operations
pub type Result<T> = std::result::Result<T, Error>;

/// Router errors
#[derive(Error, Debug)]
pub enum Error {
    /// No enabled rule matched the transaction context
    #[error("No routing rule matched the transaction context")]
    NoMatchingRule,

    /// Rate limit hit
    #[error("Admission rejected by {scope} rate limiter")]
    AdmissionRejected {
        /// Limiter that rejected the request
        scope: AdmissionScope,
    },

    /// Provider could not deliver on its channel
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        /// Provider code
        provider: String,
        /// Failure reason
        reason: FailureReason,
    },

    /// Every channel in the fallback policy failed
    #[error("Fallback exhausted after {} channel attempts", .attempts.len())]
    FallbackExhausted {
        /// Channels tried, in order, with their failure reasons
        attempts: Vec<ChannelAttempt>,
    },

    /// Condition expression could not be evaluated
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    /// Mutation attempted on a soft-deleted rule
    #[error("Routing rule {0} is deleted")]
    RuleDeleted(String),

    /// State machine transition refused
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConditionError> for Error {
    fn from(e: ConditionError) -> Self {
        Error::InvalidCondition(e.to_string())
    }
}

impl Error {
    /// Whether the error is a throttling decision
    pub fn is_throttled(&self) -> bool {
        matches!(self, Error::AdmissionRejected { .. })
    }
}
