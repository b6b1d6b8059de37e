//! # Error Types
//!
//! Domain-specific error types for medsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  medsync-core errors (this file)                                       │
//! │  ├── CoreError        - Payload and domain failures                    │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  medsync-db errors (separate crate)                                    │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  medsync-sync errors (separate crate)                                  │
//! │  └── SyncError        - What callers of the engine see                 │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A payload could not be converted to or from its field map.
    #[error("Payload serialization failed: {0}")]
    Serialization(String),

    /// The payload's kind does not match the operation's entity kind.
    ///
    /// ## When This Occurs
    /// - A persisted operation was edited or corrupted
    /// - A caller built an operation by hand with mismatched parts
    #[error("Payload kind mismatch: operation targets {expected}, payload is {actual}")]
    PayloadKindMismatch { expected: String, actual: String },

    /// A timestamp field could not be interpreted.
    #[error("Invalid timestamp in field {field}: {value}")]
    InvalidTimestamp { field: String, value: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., path separator in an id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::PayloadKindMismatch {
            expected: "medication".to_string(),
            actual: "dose".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Payload kind mismatch: operation targets medication, payload is dose"
        );

        let err = ValidationError::Required {
            field: "entity_id".to_string(),
        };
        assert_eq!(err.to_string(), "entity_id is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "entity_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
