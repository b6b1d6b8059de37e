//! # medsync-db: Database Layer for MedSync
//!
//! This crate provides local persistence for the MedSync sync engine.
//! It uses SQLite for on-device storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MedSync Data Flow                                │
//! │                                                                         │
//! │  SyncEngine (queue snapshot, cache write, key load)                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     medsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ KvRepository  │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ CacheRepo     │    │ 001_init.sql │  │   │
//! │  │   │ WAL / NORMAL  │    │ SecretRepo    │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (medsync.db)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Key/value, cache and secret repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use medsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/medsync.db")).await?;
//!
//! db.kv().put("last_sync_timestamp", "1718000000000").await?;
//! let snapshot = db.kv().get("pending_sync_operations").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::{CacheRepository, KvRepository, SecretRepository, StoredCacheValue};
