//! # Tiered Cache
//!
//! Memory-first cache backed by the SQLite cache tables.
//!
//! ## Read Path
//! ```text
//! get(key)
//!   │
//!   ├── memory hit, not expired ─────────────────────────► value
//!   ├── memory hit, expired (and !ignore_expiry) ────────► None
//!   │
//!   └── memory miss ──► cache_values + cache_expiry
//!                          │
//!                          ├── unreadable ciphertext ──► remove, None
//!                          ├── malformed value/stamp ──► remove, None
//!                          ├── expired ────────────────► None
//!                          └── fresh ──► promote to memory ──► value
//! ```
//!
//! Writes go to memory first. The persistent copy is sealed whole with the
//! [`EncryptionProvider`]; only plaintext JSON lives in memory. A failed
//! persistent write is logged and the memory value stands. Expiry is checked lazily on read and swept by
//! [`TieredCache::clean_expired_entries`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use medsync_core::Clock;
use medsync_db::CacheRepository;

use crate::crypto::EncryptionProvider;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The value could not be serialized to JSON.
    #[error("Cache value for {key} could not be serialized: {reason}")]
    Serialization { key: String, reason: String },
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Two-tier cache: in-memory map over the persistent cache tables.
pub struct TieredCache {
    memory: RwLock<HashMap<String, MemoryEntry>>,
    repo: CacheRepository,
    crypto: Arc<dyn EncryptionProvider>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    pub fn new(
        repo: CacheRepository,
        crypto: Arc<dyn EncryptionProvider>,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        TieredCache {
            memory: RwLock::new(HashMap::new()),
            repo,
            crypto,
            clock,
            default_ttl,
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Reads a value. Expired entries are `None` unless `ignore_expiry`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, ignore_expiry: bool) -> Option<T> {
        let value = self.get_value(key, ignore_expiry).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    async fn get_value(&self, key: &str, ignore_expiry: bool) -> Option<Value> {
        let now = self.clock.now();

        if let Some(entry) = self.memory.read().await.get(key) {
            if ignore_expiry || now < entry.expires_at {
                return Some(entry.value.clone());
            }
            return None;
        }

        let stored = match self.repo.get_value(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent cache read failed");
                return None;
            }
        };

        let plaintext = match self.crypto.decrypt(&stored.value) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping unreadable persisted cache value");
                self.remove_persisted(key).await;
                return None;
            }
        };

        let value = match serde_json::from_str::<Value>(&plaintext) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping malformed persisted cache value");
                self.remove_persisted(key).await;
                return None;
            }
        };

        let Some(expires_at) = stored.expires_at.as_deref().and_then(parse_expiry) else {
            warn!(key = %key, "Dropping persisted cache value without a valid expiry");
            self.remove_persisted(key).await;
            return None;
        };

        if !ignore_expiry && now >= expires_at {
            return None;
        }

        self.memory.write().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at,
            },
        );
        debug!(key = %key, "Promoted persisted cache entry to memory");

        Some(value)
    }

    /// Stores a value for `ttl` (default TTL when `None`).
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let expires_at = self.expiry_from(self.clock.now(), ttl.unwrap_or(self.default_ttl));

        let sealed = self.crypto.encrypt(&value.to_string());
        self.memory
            .write()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });

        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                // A stale sealed copy must not outlive the new memory value
                warn!(key = %key, error = %e, "Could not seal cache value, keeping memory only");
                self.remove_persisted(key).await;
                return Ok(());
            }
        };

        if let Err(e) = self.repo.put(key, &sealed, expires_at).await {
            warn!(key = %key, error = %e, "Persistent cache write failed, keeping memory value");
        }

        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        self.memory.write().await.remove(key);
        self.remove_persisted(key).await;
    }

    async fn remove_persisted(&self, key: &str) {
        if let Err(e) = self.repo.remove(key).await {
            warn!(key = %key, error = %e, "Persistent cache remove failed");
        }
    }

    pub async fn clear(&self) {
        self.memory.write().await.clear();
        if let Err(e) = self.repo.clear().await {
            warn!(error = %e, "Persistent cache clear failed");
        }
    }

    /// True if `key` is cached (and fresh, when `check_expiry`).
    pub async fn contains_key(&self, key: &str, check_expiry: bool) -> bool {
        self.get_value(key, !check_expiry).await.is_some()
    }

    /// Removes every expired entry from both tiers. Returns the number of
    /// distinct keys removed.
    pub async fn clean_expired_entries(&self) -> usize {
        let now = self.clock.now();
        let mut removed = BTreeSet::new();

        {
            let mut memory = self.memory.write().await;
            memory.retain(|key, entry| {
                let keep = now < entry.expires_at;
                if !keep {
                    removed.insert(key.clone());
                }
                keep
            });
        }

        match self.repo.expiry_index().await {
            Ok(index) => {
                let stale: Vec<String> = index
                    .into_iter()
                    .filter(|(_, stamp)| parse_expiry(stamp).map_or(true, |at| now >= at))
                    .map(|(key, _)| key)
                    .collect();

                if let Err(e) = self.repo.remove_many(&stale).await {
                    warn!(error = %e, "Failed to remove expired persisted cache entries");
                } else {
                    removed.extend(stale);
                }
            }
            Err(e) => warn!(error = %e, "Failed to read cache expiry index"),
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "Removed expired cache entries");
        }
        removed.len()
    }

    pub async fn len_in_memory(&self) -> usize {
        self.memory.read().await.len()
    }

    /// Keys held in memory, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.memory.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn parse_expiry(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FieldCipher, MemoryKeyStore};
    use medsync_core::ManualClock;
    use medsync_db::{Database, DbConfig};
    use serde_json::json;

    struct Fixture {
        cache: TieredCache,
        clock: ManualClock,
        db: Database,
        cipher: Arc<FieldCipher>,
    }

    impl Fixture {
        /// A second cache over the same tables and key.
        fn reopen(&self) -> TieredCache {
            TieredCache::new(
                self.db.cache(),
                self.cipher.clone(),
                Arc::new(self.clock.clone()),
                Duration::from_secs(3600),
            )
        }
    }

    async fn cipher() -> Arc<FieldCipher> {
        let cipher = Arc::new(FieldCipher::new(MemoryKeyStore::new()));
        cipher.initialize().await.unwrap();
        cipher
    }

    async fn setup() -> (TieredCache, ManualClock, Database) {
        let f = fixture().await;
        (f.cache, f.clock, f.db)
    }

    async fn fixture() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clock = ManualClock::default();
        let cipher = cipher().await;
        let cache = TieredCache::new(
            db.cache(),
            cipher.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
        );
        Fixture { cache, clock, db, cipher }
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_ignore_expiry() {
        let (cache, clock, _db) = setup().await;

        cache.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(cache.get::<String>("k", false).await.as_deref(), Some("v"));

        clock.advance(chrono::Duration::milliseconds(1500));

        assert_eq!(cache.get::<String>("k", false).await, None);
        assert_eq!(cache.get::<String>("k", true).await.as_deref(), Some("v"));
        assert!(!cache.contains_key("k", true).await);
        assert!(cache.contains_key("k", false).await);
    }

    #[tokio::test]
    async fn test_persistent_tier_survives_new_instance() {
        let f = fixture().await;
        f.cache.set("medications/m1", &json!({"name": "A"}), None).await.unwrap();

        let fresh = f.reopen();
        assert_eq!(fresh.len_in_memory().await, 0);

        let value: Value = fresh.get("medications/m1", false).await.unwrap();
        assert_eq!(value, json!({"name": "A"}));
        assert_eq!(fresh.keys().await, vec!["medications/m1"]);
    }

    #[tokio::test]
    async fn test_expired_persistent_entry_not_promoted() {
        let f = fixture().await;
        f.cache.set("k", &1, Some(Duration::from_secs(10))).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(11));

        let fresh = f.reopen();
        assert_eq!(fresh.get::<i32>("k", false).await, None);
        assert_eq!(fresh.len_in_memory().await, 0);
        assert_eq!(fresh.get::<i32>("k", true).await, Some(1));
    }

    #[tokio::test]
    async fn test_clean_expired_entries() {
        let (cache, clock, db) = setup().await;
        cache.set("short", &1, Some(Duration::from_secs(5))).await.unwrap();
        cache.set("long", &2, Some(Duration::from_secs(500))).await.unwrap();

        clock.advance(chrono::Duration::seconds(6));

        assert_eq!(cache.clean_expired_entries().await, 1);
        assert_eq!(cache.keys().await, vec!["long"]);
        assert!(db.cache().get_value("short").await.unwrap().is_none());
        assert_eq!(cache.get::<i32>("short", true).await, None);
        assert_eq!(cache.clean_expired_entries().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_persisted_entries_are_dropped() {
        let f = fixture().await;
        let later = f.clock.now() + chrono::Duration::hours(1);
        let sealed = f.cipher.encrypt("{not json").unwrap();
        f.db.cache().put("bad-json", &sealed, later).await.unwrap();
        f.db.cache().put("plain", r#"{"name":"A"}"#, later).await.unwrap();

        assert_eq!(f.cache.get::<Value>("bad-json", false).await, None);
        assert!(f.db.cache().get_value("bad-json").await.unwrap().is_none());

        // Rows not sealed with this key are unreadable and dropped
        assert_eq!(f.cache.get::<Value>("plain", false).await, None);
        assert!(f.db.cache().get_value("plain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_values_are_sealed() {
        let f = fixture().await;
        let record = json!({"name": "Warfarin", "strength": 5.0, "notes": "with food"});
        f.cache.set("medications/med-1", &record, None).await.unwrap();

        let stored = f.db.cache().get_value("medications/med-1").await.unwrap().unwrap();
        assert!(!stored.value.contains("Warfarin"));
        assert!(!stored.value.contains("with food"));
        assert!(!stored.value.contains("strength"));

        let value: Value = f.reopen().get("medications/med-1", false).await.unwrap();
        assert_eq!(value, record);
    }

    #[tokio::test]
    async fn test_unsealable_value_stays_in_memory_only() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clock = ManualClock::default();
        let uninitialized = Arc::new(FieldCipher::new(MemoryKeyStore::new()));
        let cache = TieredCache::new(
            db.cache(),
            uninitialized,
            Arc::new(clock),
            Duration::from_secs(3600),
        );

        cache.set("k", &json!({"name": "A"}), None).await.unwrap();
        assert_eq!(cache.get::<Value>("k", false).await, Some(json!({"name": "A"})));
        assert!(db.cache().get_value("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (cache, _clock, db) = setup().await;
        cache.set("a", &1, None).await.unwrap();
        cache.set("b", &2, None).await.unwrap();

        cache.remove("a").await;
        assert_eq!(cache.get::<i32>("a", true).await, None);

        cache.clear().await;
        assert_eq!(cache.len_in_memory().await, 0);
        assert!(db.cache().expiry_index().await.unwrap().is_empty());
    }
}
