//! # Repository Module
//!
//! Database repository implementations for the MedSync local store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  medsync-sync component                                                │
//! │       │                                                                 │
//! │       │  db.kv().put("pending_sync_operations", json)                  │
//! │       ▼                                                                 │
//! │  KvRepository       ── kv_store       (engine state snapshots)         │
//! │  CacheRepository    ── cache_values   (persistent cache tier)          │
//! │                     └─ cache_expiry   (key → ISO-8601 expiry)          │
//! │  SecretRepository   ── secure_keys    (development key storage)        │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repositories deal in strings and bytes only. Serialization, encryption
//! and expiry policy belong to the callers in medsync-sync.
//!
//! ## Available Repositories
//!
//! - [`KvRepository`] - Durable key/value entries
//! - [`CacheRepository`] - Cache values plus expiry side index
//! - [`SecretRepository`] - Named key material

pub mod cache;
pub mod kv;
pub mod secret;

pub use cache::{CacheRepository, StoredCacheValue};
pub use kv::KvRepository;
pub use secret::SecretRepository;
