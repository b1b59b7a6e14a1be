//! Error types for the Raft engine.

use thiserror::Error;

/// Raft-specific errors.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Node is not the leader.
    #[error("not leader, leader hint: {leader_hint:?}")]
    NotLeader {
        /// The leader this node currently believes in, if any.
        leader_hint: Option<String>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state transition or argument.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The durable log no longer matches the in-memory indices.
    #[error("log corrupt: {0}")]
    Corrupt(String),
}

/// Result type for Raft operations.
pub type Result<T> = std::result::Result<T, RaftError>;
