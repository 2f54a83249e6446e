//! Error types for shardfs
//!
//! Provides a unified error type for storage, transport and replication operations.

use thiserror::Error;

/// Result type alias for shardfs operations
pub type Result<T> = std::result::Result<T, ShardFsError>;

/// Unified error type for shardfs
#[derive(Error, Debug)]
pub enum ShardFsError {
    // ===== Storage Errors =====
    #[error("Not found: {0}")]
    NotFound(String),

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ===== Transport Errors =====
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Timed out waiting on {peer}")]
    Timeout { peer: String },

    #[error("Network error: {0}")]
    Network(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardFsError {
    /// Map an I/O error to `NotFound` when the file is missing, `Io` otherwise
    pub fn from_io(err: std::io::Error, what: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ShardFsError::NotFound(what.to_string())
        } else {
            ShardFsError::Io(err)
        }
    }

    /// True for the missing-object condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShardFsError::NotFound(_))
    }
}

impl From<bincode::Error> for ShardFsError {
    fn from(err: bincode::Error) -> Self {
        ShardFsError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShardFsError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        assert_eq!(err.to_string(), "Invalid key length: expected 32, got 16");

        let err = ShardFsError::Timeout {
            peer: "127.0.0.1:3000".to_string(),
        };
        assert_eq!(err.to_string(), "Timed out waiting on 127.0.0.1:3000");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ShardFsError = io_err.into();
        assert!(matches!(err, ShardFsError::Io(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ShardFsError::from_io(io_err, "some/key");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: some/key");

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert!(!ShardFsError::from_io(io_err, "some/key").is_not_found());
    }
}
