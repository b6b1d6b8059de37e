//! # medsync-sync: Offline Sync Engine for MedSync
//!
//! This crate keeps medication, dose and schedule writes usable while the
//! device is offline and delivers them to the remote document store once it
//! is reachable again.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncEngine (Main Orchestrator)                 │  │
//! │  │                                                                  │  │
//! │  │  Built once with explicit collaborators (SyncEngineBuilder)      │  │
//! │  │  Owns every background task, stopped by shutdown()               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OperationQueue │  │ TieredCache    │  │ ConflictResolver       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Bounded FIFO   │  │ Memory over    │  │ UseLocal / UseRemote   │    │
//! │  │ retry backoff  │  │ SQLite, TTL    │  │ Merge / UseCustom      │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OfflineStore   │  │ FieldCipher    │  │ AvailabilityTracker    │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Encrypted      │  │ AES-256-GCM    │  │ Probe, persist flag,   │    │
//! │  │ local records  │  │ + salted hash  │  │ re-probe while down    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  SEAMS (traits):                                                       │
//! │  • RemoteAdapter      - the remote document store                      │
//! │  • AuthProvider       - who is signed in                               │
//! │  • EncryptionProvider - field encryption and hashing                   │
//! │  • SecureKeyStore     - where key material lives                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - `SyncEngine` orchestrator and builder
//! - [`config`] - Engine configuration (TOML file, env overrides)
//! - [`error`] - Sync error types
//! - [`status`] - Status snapshots and pass outcomes
//!
//! ### Components
//! - [`queue`] - Bounded operation queue and retry schedule
//! - [`store`] - Persisted queue and conflict snapshots
//! - [`cache`] - Two-tier TTL cache
//! - [`offline`] - Encrypted offline records
//! - [`crypto`] - Field encryption, hashing, key storage
//! - [`availability`] - Remote reachability tracking
//! - [`resolver`] - Conflict resolution strategies
//! - [`scheduler`] - Cancellable periodic tasks
//!
//! ### Seams
//! - [`remote`] - Remote adapter trait and in-memory store
//! - [`auth`] - Auth provider trait and watch-backed state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use medsync_core::{EntityPayload, MedicationFields};
//! use medsync_sync::{AuthState, SyncConfig, SyncEngine};
//!
//! let auth = AuthState::signed_in("user-1");
//! let engine = SyncEngine::builder(SyncConfig::load_or_default(None))
//!     .remote(firestore_adapter)
//!     .auth(auth.clone())
//!     .build()
//!     .await?;
//! engine.start().await?;
//!
//! engine
//!     .create("med-1", EntityPayload::Medication(MedicationFields {
//!         name: Some("Levothyroxine".into()),
//!         ..Default::default()
//!     }))
//!     .await?;
//!
//! let result = engine.force_sync().await?;
//! println!("{}", result.message);
//!
//! engine.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod config;
pub mod engine;
pub mod error;
pub mod status;

// Components
pub mod availability;
pub mod cache;
pub mod crypto;
pub mod offline;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod store;

// Seams
pub mod auth;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

// Engine types
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEngineBuilder, USER_ID_FIELD};
pub use error::{SyncError, SyncResult};
pub use status::{ForceSyncResult, SyncOutcome, SyncState, SyncStatus, SyncSummary};

// Component types
pub use availability::AvailabilityTracker;
pub use cache::{CacheError, TieredCache};
pub use crypto::{
    CryptoError, DbKeyStore, EncryptionProvider, FieldCipher, MemoryKeyStore, SecureKeyStore,
};
pub use offline::OfflineRecord;
pub use scheduler::{FirstTick, ScheduledTask, TaskControl};

// Seam types
pub use auth::{AuthProvider, AuthState};
pub use remote::{
    BatchWrite, MemoryRemote, QueryFilter, RemoteAdapter, RemoteDocument, RemoteError,
    RemoteResult,
};
