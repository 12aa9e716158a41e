// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum PeridotError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    // --- Invalid input: surfaced to the caller, never retried ---
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // --- Not found: negative result, not logged as an error ---
    #[error("Unknown node '{0}'")]
    NodeNotFound(String),

    #[error("Unknown backend server '{0}'")]
    ServerNotFound(String),

    #[error("No routing rule matches service '{0}'")]
    RuleNotFound(String),

    #[error("Unknown partition '{0}'")]
    PartitionNotFound(String),

    #[error("Unknown region '{0}'")]
    RegionNotFound(String),

    // --- Stale updates: dropped silently with a counter increment ---
    #[error("Value does not override the stored entry")]
    StaleValue,

    #[error("Stale state update: local version {local}, received {received}")]
    StaleState { local: u64, received: u64 },

    // --- Authentication ---
    #[error("Signature verification failed")]
    SignatureInvalid,

    // --- Transient: retried with backoff, then surfaced ---
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    // --- Capacity: surfaced so the caller can apply back-pressure ---
    #[error("Request queue is full")]
    QueueFull,

    #[error("Connection limit reached on '{0}'")]
    ConnectionLimit(String),

    // --- Protocol / state ---
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<String>),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("No replacement candidate available")]
    NoCandidate,

    // --- Fatal: the subsystem refuses to start ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PeridotError {
    fn from(e: std::io::Error) -> Self {
        PeridotError::Io(Arc::new(e))
    }
}

impl From<regex::Error> for PeridotError {
    fn from(e: regex::Error) -> Self {
        PeridotError::InvalidConfig(format!("invalid rule pattern: {e}"))
    }
}

impl From<bincode::error::EncodeError> for PeridotError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PeridotError::Internal(format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for PeridotError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PeridotError::InvalidRequest(format!("decode error: {e}"))
    }
}

impl PeridotError {
    /// True for failures that are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeridotError::Transport(_)
                | PeridotError::Timeout(_)
                | PeridotError::TargetUnreachable(_)
                | PeridotError::Io(_)
        )
    }
}
