//! # Validation Module
//!
//! Checks applied to operations before they are accepted into the queue and
//! again when persisted operations are reloaded.
//!
//! ## Usage
//! ```rust
//! use medsync_core::validation::{validate_entity_id, validate_operation};
//! use medsync_core::{EntityPayload, MedicationFields, SyncOperation};
//!
//! validate_entity_id("med-42").unwrap();
//!
//! let op = SyncOperation::create(
//!     "med-42",
//!     EntityPayload::Medication(MedicationFields {
//!         name: Some("Metformin".into()),
//!         ..Default::default()
//!     }),
//!     chrono::Utc::now(),
//! );
//! validate_operation(&op).unwrap();
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{SyncAction, SyncOperation};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted entity id or collection name.
pub const MAX_IDENTIFIER_LEN: usize = 128;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a document identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Must not contain `/` (it would escape the collection path)
pub fn validate_entity_id(id: &str) -> ValidationResult<()> {
    validate_identifier("entity_id", id)
}

/// Validates a custom collection name. Same rules as entity ids.
pub fn validate_collection_name(name: &str) -> ValidationResult<()> {
    validate_identifier("collection", name)
}

fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    if value.contains('/') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain '/'".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Operation Validator
// =============================================================================

/// Validates a whole operation.
///
/// ## Rules
/// - Entity id and (for custom kinds) collection name are valid identifiers
/// - Payload kind matches `entity_kind`
/// - Creates and updates carry at least one field
pub fn validate_operation(op: &SyncOperation) -> CoreResult<()> {
    validate_entity_id(&op.entity_id)?;
    validate_collection_name(&op.entity_kind.collection())?;

    let payload_kind = op.payload.kind();
    if payload_kind != op.entity_kind {
        return Err(CoreError::PayloadKindMismatch {
            expected: op.entity_kind.to_string(),
            actual: payload_kind.to_string(),
        });
    }

    if op.action != SyncAction::Delete && op.payload.is_empty() {
        return Err(ValidationError::Required {
            field: "payload".to_string(),
        }
        .into());
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
