//! # medsync-core: Pure Sync Domain for MedSync
//!
//! This crate holds the types and decisions of the offline sync engine as
//! pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MedSync Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Mobile shell (screens, forms)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ plain records                          │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    medsync-sync (SyncEngine)                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ medsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ conflict  │  │validation │  │   clock   │  │   │
//! │  │   │ Operation │  │  detect   │  │  ids      │  │  System   │  │   │
//! │  │   │ Payload   │  │  merge    │  │  payload  │  │  Manual   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Operations, entity kinds, typed payloads
//! - [`conflict`] - Conflict records, detection policy, merge
//! - [`validation`] - Operation and identifier checks
//! - [`clock`] - Injectable time source
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use medsync_core::{ConflictPolicy, EntityPayload, FieldMap, MedicationFields, SyncOperation};
//!
//! let created = Utc::now();
//! let op = SyncOperation::update(
//!     "med-1",
//!     EntityPayload::Medication(MedicationFields {
//!         strength: Some(10.0),
//!         ..Default::default()
//!     }),
//!     created,
//! );
//!
//! let mut remote = FieldMap::new();
//! remote.insert("strength".into(), 20.into());
//! remote.insert("updatedAt".into(), (created + Duration::minutes(1)).to_rfc3339().into());
//!
//! let conflict = ConflictPolicy::default().detect(&op, &remote).unwrap();
//! assert!(conflict.unwrap().conflicting_fields.contains("strength"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod conflict;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{
    merge_fields, ConflictData, ConflictPolicy, ConflictResolutionItem, DetectionMode,
    FieldPreference, MergeRules, ResolutionStrategy,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Remote modification stamp compared during conflict detection.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Remote creation stamp.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Epoch millis of the last local write, kept on offline records.
pub const OFFLINE_TIMESTAMP_FIELD: &str = "_offline_timestamp";

/// Per-document local write counter, kept on offline records.
pub const OFFLINE_VERSION_FIELD: &str = "_offline_version";
