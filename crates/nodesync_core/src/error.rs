use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::RejectReason;

/// Unified error type for nodesync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Write-path rejections
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Revision conflict on '{id}': expected revision {expected}")]
    ConcurrencyConflict { id: String, expected: i64 },

    #[error("Mutation '{0}' exhausted its retry budget")]
    RetryExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type alias for nodesync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Rejections that will never succeed on retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::Permission(_)
                | SyncError::NotFound(_)
                | SyncError::InvalidInput(_)
        )
    }

    /// Failures worth retrying without touching entity state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::ConcurrencyConflict { .. }
        )
    }

    /// Classify this error as the rejection reason reported to a pushing client.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            SyncError::Validation(_) | SyncError::InvalidInput(_) | SyncError::Crdt(_) => {
                RejectReason::Validation
            }
            SyncError::Permission(_) => RejectReason::Permission,
            SyncError::NotFound(_) => RejectReason::NotFound,
            SyncError::ConcurrencyConflict { .. } => RejectReason::Conflict,
            _ => RejectReason::Internal,
        }
    }

    /// Convert to a serializable representation for transport responses
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of SyncError for wire responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::Validation(_) => "Validation",
            SyncError::Permission(_) => "Permission",
            SyncError::ConcurrencyConflict { .. } => "ConcurrencyConflict",
            SyncError::RetryExhausted(_) => "RetryExhausted",
            SyncError::NotFound(_) => "NotFound",
            SyncError::InvalidInput(_) => "InvalidInput",
            SyncError::Transport(_) => "Transport",
            SyncError::Crdt(_) => "Crdt",
            SyncError::Database(_) => "Database",
            SyncError::Serialization(_) => "Serialization",
            SyncError::Io(_) => "Io",
            SyncError::ConfigParse(_) => "ConfigParse",
            SyncError::ConfigSerialize(_) => "ConfigSerialize",
            SyncError::NoConfigDir => "NoConfigDir",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}
