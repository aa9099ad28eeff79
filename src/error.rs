// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! Errors are categorized by their source (storage, registry, transfer)
//! and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Storage` | Yes | SQLite errors (busy/locked, transient IO) |
//! | `Transfer` | Yes | Resource transfer failed mid-flight |
//! | `Replicator` | Yes | A descriptor capability failed transiently |
//! | `UnknownReplicableType` | No | Deploy-version skew between nodes |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`GeoError::is_retryable()`] to determine if a unit of work should
//! be re-enqueued with backoff. Checksum mismatches are deliberately NOT
//! errors: they are a `failed` verification state transition, surfaced for
//! repair. Pruner safety aborts are likewise not errors but deliberate
//! no-op outcomes (see [`crate::pruner::PruneOutcome`]).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, GeoError>;

/// Errors that can occur in the replication core.
#[derive(Error, Debug)]
pub enum GeoError {
    /// SQLite error from the journal, status, or verification stores.
    ///
    /// Retryable: busy/locked conditions resolve on their own, and the
    /// per-call busy retry already absorbed the short-lived ones.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// No descriptor registered for a replicable type name.
    ///
    /// This indicates deploy-version skew between primary and secondary
    /// (one side knows about a type the other does not). Not retryable;
    /// needs operator attention.
    #[error("Unknown replicable type: {0}")]
    UnknownReplicableType(String),

    /// Resource transfer failed (network, remote storage).
    ///
    /// Retryable with backoff by the worker infrastructure.
    #[error("Transfer error ({replicable_type}/{resource_id}): {message}")]
    Transfer {
        replicable_type: String,
        resource_id: String,
        message: String,
    },

    /// A replicator descriptor capability failed.
    ///
    /// Retryable: descriptors talk to external storage that may be
    /// temporarily unavailable.
    #[error("Replicator error: {0}")]
    Replicator(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable: fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g. calling `start()` on an already-running engine).
    /// Not retryable; indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GeoError {
    /// Create a transfer error.
    pub fn transfer(
        replicable_type: impl Into<String>,
        resource_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transfer {
            replicable_type: replicable_type.into(),
            resource_id: resource_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable by the worker infrastructure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::Transfer { .. } => true,
            Self::Replicator(_) => true,
            Self::UnknownReplicableType(_) => false, // Deploy skew, needs attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_is_retryable() {
        let err = GeoError::Storage(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transfer_is_retryable() {
        let err = GeoError::transfer("snippets", "42", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("snippets/42"));
    }

    #[test]
    fn test_replicator_is_retryable() {
        let err = GeoError::Replicator("remote store unavailable".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_type_not_retryable() {
        let err = GeoError::UnknownReplicableType("widgets".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("widgets"));
    }

    #[test]
    fn test_config_not_retryable() {
        let err = GeoError::Config("bad sqlite path".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_state_not_retryable() {
        let err = GeoError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_shutdown_not_retryable() {
        assert!(!GeoError::Shutdown.is_retryable());
    }

    #[test]
    fn test_internal_not_retryable() {
        let err = GeoError::Internal("unexpected".to_string());
        assert!(!err.is_retryable());
    }
}
