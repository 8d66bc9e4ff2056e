//! Consumer error types
//!
//! Two families of errors live here:
//! - [`ConsumerError`]: failures of the worker machinery (Redis, acks, lifecycle)
//! - [`HandlerError`]: failures reported by message handlers, which never
//!   crash the loop and are mapped to a [`ProcessingOutcome`](crate::ProcessingOutcome)

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors raised by the consumer machinery
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Redis unreachable after the configured retries were exhausted
    #[error("Connection error: {0}")]
    Connection(String),

    /// Ack, claim or dead-letter command failed
    #[error("Acknowledgment failed for {message_id}: {reason}")]
    Acknowledgment { message_id: String, reason: String },

    /// Non-connection Redis error (NOGROUP, WRONGTYPE, ...)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Error reported by a non-Redis store
    #[error("Store error: {0}")]
    Store(String),

    /// Environment configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// Configuration loaded but rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Lifecycle operation not allowed in the current state
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: LifecycleState,
    },

    /// Connect and group setup did not finish within the start timeout
    #[error("Start timed out after {0:?}")]
    StartTimeout(Duration),

    /// Entry ID could not be parsed
    #[error(transparent)]
    InvalidEntryId(#[from] InvalidEntryId),

    /// Redis returned a reply that does not match the expected shape
    #[error("Malformed reply: {0}")]
    Malformed(String),

    /// Prometheus recorder could not be installed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ConsumerError {
    /// Create an acknowledgment error
    pub fn acknowledgment(message_id: impl ToString, reason: impl ToString) -> Self {
        ConsumerError::Acknowledgment {
            message_id: message_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the dispatch loop must stop on this error.
    ///
    /// Only a connection that stayed down through every retry is fatal;
    /// everything else is logged and the loop keeps going.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::Connection(_))
    }

    /// Whether the consumer group (or its stream) no longer exists
    pub fn is_nogroup(&self) -> bool {
        match self {
            ConsumerError::Redis(e) => e.to_string().contains("NOGROUP"),
            ConsumerError::Store(msg) => msg.contains("NOGROUP"),
            _ => false,
        }
    }
}

/// Stream entry ID that is not of the form `<ms>-<seq>`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream entry id: {0:?}")]
pub struct InvalidEntryId(pub String);

/// Error returned by a message handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Temporary failure, the message is redelivered later
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure, the message is dead-lettered
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Create a transient handler error
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    /// Create a permanent handler error
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// A payload that does not deserialize will never deserialize
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("invalid payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_fatal() {
        assert!(ConsumerError::Connection("refused".into()).is_fatal());
        assert!(!ConsumerError::acknowledgment("1-0", "timeout").is_fatal());
        assert!(!ConsumerError::Store("boom".into()).is_fatal());
        assert!(!ConsumerError::Malformed("PING replied \"nope\"".into()).is_fatal());
    }

    #[test]
    fn test_nogroup_detection() {
        let err = ConsumerError::Store("NOGROUP No such key 'orders'".into());
        assert!(err.is_nogroup());
        assert!(!ConsumerError::Store("WRONGTYPE".into()).is_nogroup());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ConsumerError::InvalidState {
            action: "start",
            state: LifecycleState::Running,
        };
        assert_eq!(err.to_string(), "Cannot start while running");
    }

    #[test]
    fn test_serde_error_is_permanent() {
        let err: HandlerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_handler_error_constructors() {
        assert!(HandlerError::transient("busy").is_retryable());
        assert_eq!(
            HandlerError::permanent("bad").to_string(),
            "Permanent failure: bad"
        );
    }
}
