// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the control plane.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Frame exceeds the configured maximum size ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("Malformed payload for message '{0}': {1}")]
    MalformedPayload(&'static str, String),

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Forwarding protocol fault: {0}")]
    ForwardingFault(String),

    /// A peer supervisor declared membership in a different cluster.
    /// Fatal on the master; the run loop terminates the process.
    #[error("Cluster name mismatch: peer reported '{reported}', local is '{local}'")]
    ClusterNameMismatch { reported: String, local: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ShardError {
    fn clone(&self) -> Self {
        match self {
            ShardError::Io(e) => ShardError::Io(Arc::clone(e)),
            ShardError::IncompleteData => ShardError::IncompleteData,
            ShardError::FrameTooLarge(n) => ShardError::FrameTooLarge(*n),
            ShardError::MalformedPayload(name, s) => ShardError::MalformedPayload(name, s.clone()),
            ShardError::SpawnFailed(s) => ShardError::SpawnFailed(s.clone()),
            ShardError::ForwardingFault(s) => ShardError::ForwardingFault(s.clone()),
            ShardError::ClusterNameMismatch { reported, local } => ShardError::ClusterNameMismatch {
                reported: reported.clone(),
                local: local.clone(),
            },
            ShardError::InvalidRequest(s) => ShardError::InvalidRequest(s.clone()),
            ShardError::InvalidState(s) => ShardError::InvalidState(s.clone()),
            ShardError::ConnectionClosed => ShardError::ConnectionClosed,
            ShardError::Internal(s) => ShardError::Internal(s.clone()),
        }
    }
}

impl PartialEq for ShardError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ShardError::Io(e1), ShardError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ShardError::FrameTooLarge(a), ShardError::FrameTooLarge(b)) => a == b,
            (ShardError::MalformedPayload(n1, s1), ShardError::MalformedPayload(n2, s2)) => {
                n1 == n2 && s1 == s2
            }
            (ShardError::SpawnFailed(a), ShardError::SpawnFailed(b)) => a == b,
            (ShardError::ForwardingFault(a), ShardError::ForwardingFault(b)) => a == b,
            (
                ShardError::ClusterNameMismatch { reported: r1, local: l1 },
                ShardError::ClusterNameMismatch { reported: r2, local: l2 },
            ) => r1 == r2 && l1 == l2,
            (ShardError::InvalidRequest(a), ShardError::InvalidRequest(b)) => a == b,
            (ShardError::InvalidState(a), ShardError::InvalidState(b)) => a == b,
            (ShardError::Internal(a), ShardError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ShardError {
    fn from(e: std::io::Error) -> Self {
        ShardError::Io(Arc::new(e))
    }
}

impl From<String> for ShardError {
    fn from(s: String) -> Self {
        ShardError::Internal(s)
    }
}

impl From<bincode::error::EncodeError> for ShardError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ShardError::Internal(format!("Payload encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for ShardError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ShardError::MalformedPayload("<bincode>", e.to_string())
    }
}
