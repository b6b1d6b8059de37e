//! # Sync Error Types
//!
//! Error types for sync engine operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Caller-facing  │  │     Component           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  NotAuthenticated│ │  Remote(RemoteError)    │ │
//! │  │  ConfigLoad     │  │  ConflictNotFound│ │  Crypto(CryptoError)    │ │
//! │  │  ConfigSave     │  │  Validation     │  │  Cache(CacheError)      │ │
//! │  │                 │  │  InProgress     │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Storage      │  │    Lifecycle    │                              │
//! │  │                 │  │                 │                              │
//! │  │  DatabaseError  │  │  NotStarted     │                              │
//! │  │  Serialization  │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts are not errors. A pass reports them as an outcome and they are
//! published on the conflict channel.

use thiserror::Error;

use crate::cache::CacheError;
use crate::crypto::CryptoError;
use crate::remote::RemoteError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all caller-visible failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// No signed-in user. Writes are rejected, never queued.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// No unresolved conflict carries this id.
    #[error("Conflict not found: {id}")]
    ConflictNotFound { id: String },

    /// Another call is already resolving this conflict.
    #[error("Conflict {id} is already being resolved")]
    ResolutionInProgress { id: String },

    /// Operation or identifier failed validation.
    #[error("Invalid operation: {0}")]
    Validation(#[from] medsync_core::CoreError),

    // =========================================================================
    // Component Errors
    // =========================================================================
    /// Remote store failure, already translated at the adapter boundary.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize or parse persisted state.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// `start()` has not been called.
    #[error("Sync engine not started")]
    NotStarted,

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<medsync_db::DbError> for SyncError {
    fn from(err: medsync_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<medsync_core::ValidationError> for SyncError {
    fn from(err: medsync_core::ValidationError) -> Self {
        SyncError::Validation(err.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Remote(RemoteError::Timeout { after_ms: 10_000 }).is_retryable());
        assert!(SyncError::Remote(RemoteError::Unavailable("down".into())).is_retryable());

        assert!(!SyncError::Remote(RemoteError::PermissionDenied("rules".into())).is_retryable());
        assert!(!SyncError::NotAuthenticated.is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_validation_conversion() {
        let err: SyncError = medsync_core::ValidationError::Required {
            field: "entity_id".into(),
        }
        .into();

        assert!(matches!(err, SyncError::Validation(_)));
        assert!(err.to_string().contains("entity_id"));
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::ConfigLoadFailed("x".into()).is_config_error());
        assert!(!SyncError::ShuttingDown.is_config_error());
    }
}
