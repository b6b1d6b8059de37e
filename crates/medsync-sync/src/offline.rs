//! # Offline Store
//!
//! Durable copy of every record written locally, so reads keep working when
//! the cache has expired and the remote is unreachable.
//!
//! ## Layout (kv key `offline_data_cache`)
//! ```text
//! {
//!   "medications": {
//!     "med-1": {
//!       "name": "<ciphertext>",          sensitive fields encrypted
//!       "hash_name": "<hex digest>",     searchable index
//!       "unit": "mg",                    everything else in the clear
//!       "_offline_timestamp": 1718000000000,
//!       "_offline_version": 3
//!     }
//!   },
//!   "doses": { ... }
//! }
//! ```
//!
//! The whole map is held in memory and rewritten on every change.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use medsync_core::{EntityKind, FieldMap, OFFLINE_TIMESTAMP_FIELD, OFFLINE_VERSION_FIELD};
use medsync_db::KvRepository;

use crate::crypto::{
    decrypt_record, encrypt_record, searchable_fields, sensitive_fields, EncryptionProvider,
    DECRYPTION_FAILED_FLAG,
};
use crate::error::SyncResult;

/// Persisted key holding the offline map.
pub const OFFLINE_DATA_KEY: &str = "offline_data_cache";

type CollectionMap = BTreeMap<String, FieldMap>;

/// A decrypted offline record.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineRecord {
    pub id: String,
    /// Decrypted fields without offline bookkeeping.
    pub fields: FieldMap,
    pub updated_at_ms: i64,
    pub version: u64,
    pub decryption_failed: bool,
}

pub struct OfflineStore {
    kv: KvRepository,
    crypto: Arc<dyn EncryptionProvider>,
    data: Mutex<BTreeMap<String, CollectionMap>>,
}

impl std::fmt::Debug for OfflineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineStore").finish_non_exhaustive()
    }
}

impl OfflineStore {
    pub fn new(kv: KvRepository, crypto: Arc<dyn EncryptionProvider>) -> Self {
        OfflineStore {
            kv,
            crypto,
            data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Loads the persisted map. A corrupt snapshot is logged and replaced
    /// by an empty one.
    pub async fn load(&self) -> SyncResult<()> {
        let raw = self.kv.get(OFFLINE_DATA_KEY).await?;
        let loaded = match raw {
            None => BTreeMap::new(),
            Some(raw) => match serde_json::from_str::<BTreeMap<String, CollectionMap>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "Offline data snapshot is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
        };

        let count: usize = loaded.values().map(|c| c.len()).sum();
        debug!(records = count, "Loaded offline data");
        *self.data.lock().await = loaded;
        Ok(())
    }

    async fn persist(&self, data: &BTreeMap<String, CollectionMap>) -> SyncResult<()> {
        let raw = serde_json::to_string(data)?;
        self.kv.put(OFFLINE_DATA_KEY, &raw).await?;
        Ok(())
    }

    /// Stores `fields` as the current local copy of a record.
    pub async fn put(
        &self,
        kind: &EntityKind,
        id: &str,
        fields: &FieldMap,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut stored = encrypt_record(
            self.crypto.as_ref(),
            &strip_bookkeeping(fields),
            sensitive_fields(kind),
            searchable_fields(kind),
        )?;

        let mut data = self.data.lock().await;
        let collection = data.entry(kind.collection()).or_default();
        let version = collection
            .get(id)
            .and_then(|prev| prev.get(OFFLINE_VERSION_FIELD))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;

        stored.insert(
            OFFLINE_TIMESTAMP_FIELD.to_string(),
            Value::from(now.timestamp_millis()),
        );
        stored.insert(OFFLINE_VERSION_FIELD.to_string(), Value::from(version));
        collection.insert(id.to_string(), stored);

        self.persist(&data).await
    }

    pub async fn get(&self, kind: &EntityKind, id: &str) -> Option<OfflineRecord> {
        let data = self.data.lock().await;
        let stored = data.get(&kind.collection())?.get(id)?;
        Some(self.open(kind, id, stored))
    }

    /// Every record of a kind, ordered by id.
    pub async fn list(&self, kind: &EntityKind) -> Vec<OfflineRecord> {
        let data = self.data.lock().await;
        data.get(&kind.collection())
            .map(|collection| {
                collection
                    .iter()
                    .map(|(id, stored)| self.open(kind, id, stored))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes a record. Returns false if it was not stored.
    pub async fn remove(&self, kind: &EntityKind, id: &str) -> SyncResult<bool> {
        let mut data = self.data.lock().await;
        let removed = data
            .get_mut(&kind.collection())
            .and_then(|collection| collection.remove(id))
            .is_some();

        if removed {
            self.persist(&data).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> SyncResult<()> {
        let mut data = self.data.lock().await;
        data.clear();
        self.persist(&data).await
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.values().map(|c| c.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn open(&self, kind: &EntityKind, id: &str, stored: &FieldMap) -> OfflineRecord {
        let updated_at_ms = stored
            .get(OFFLINE_TIMESTAMP_FIELD)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let version = stored
            .get(OFFLINE_VERSION_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut fields = decrypt_record(self.crypto.as_ref(), stored, sensitive_fields(kind));
        let decryption_failed = fields.remove(DECRYPTION_FAILED_FLAG).is_some();
        if decryption_failed {
            warn!(entity_kind = %kind, id = %id, "Offline record has undecryptable fields");
        }

        OfflineRecord {
            id: id.to_string(),
            fields: strip_bookkeeping(&fields),
            updated_at_ms,
            version,
            decryption_failed,
        }
    }
}

/// Drops offline bookkeeping fields.
pub fn strip_bookkeeping(fields: &FieldMap) -> FieldMap {
    fields
        .iter()
        .filter(|(name, _)| {
            name.as_str() != OFFLINE_TIMESTAMP_FIELD
                && name.as_str() != OFFLINE_VERSION_FIELD
                && name.as_str() != DECRYPTION_FAILED_FLAG
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FieldCipher, MemoryKeyStore, DECRYPTION_FAILED_PLACEHOLDER};
    use medsync_db::{Database, DbConfig};
    use serde_json::json;

    async fn setup() -> (OfflineStore, Arc<FieldCipher>, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cipher = Arc::new(FieldCipher::new(MemoryKeyStore::new()));
        cipher.initialize().await.unwrap();
        let store = OfflineStore::new(db.kv(), cipher.clone());
        store.load().await.unwrap();
        (store, cipher, db)
    }

    fn medication() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Metformin"));
        fields.insert("strength".into(), json!(500));
        fields.insert("unit".into(), json!("mg"));
        fields
    }

    #[tokio::test]
    async fn test_sensitive_fields_encrypted_at_rest() {
        let (store, _cipher, db) = setup().await;
        let now = Utc::now();
        store.put(&EntityKind::Medication, "med-1", &medication(), now).await.unwrap();

        let raw = db.kv().get(OFFLINE_DATA_KEY).await.unwrap().unwrap();
        assert!(!raw.contains("Metformin"));
        assert!(raw.contains("hash_name"));
        assert!(raw.contains("\"unit\":\"mg\""));

        let record = store.get(&EntityKind::Medication, "med-1").await.unwrap();
        assert_eq!(record.fields, medication());
        assert_eq!(record.version, 1);
        assert_eq!(record.updated_at_ms, now.timestamp_millis());
        assert!(!record.decryption_failed);
    }

    #[tokio::test]
    async fn test_version_increments_per_document() {
        let (store, _cipher, _db) = setup().await;
        let now = Utc::now();
        store.put(&EntityKind::Medication, "med-1", &medication(), now).await.unwrap();
        store.put(&EntityKind::Medication, "med-1", &medication(), now).await.unwrap();
        store.put(&EntityKind::Medication, "med-2", &medication(), now).await.unwrap();

        assert_eq!(store.get(&EntityKind::Medication, "med-1").await.unwrap().version, 2);
        assert_eq!(store.get(&EntityKind::Medication, "med-2").await.unwrap().version, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_reload_from_kv() {
        let (store, cipher, db) = setup().await;
        store.put(&EntityKind::Dose, "d-1", &FieldMap::new(), Utc::now()).await.unwrap();

        let reopened = OfflineStore::new(db.kv(), cipher);
        reopened.load().await.unwrap();
        assert_eq!(reopened.list(&EntityKind::Dose).await.len(), 1);
        assert!(reopened.list(&EntityKind::Medication).await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_key_yields_placeholder() {
        let (store, _cipher, db) = setup().await;
        store.put(&EntityKind::Medication, "med-1", &medication(), Utc::now()).await.unwrap();

        // Same data, different key material
        let other = Arc::new(FieldCipher::new(MemoryKeyStore::new()));
        other.initialize().await.unwrap();
        let reopened = OfflineStore::new(db.kv(), other);
        reopened.load().await.unwrap();

        let record = reopened.get(&EntityKind::Medication, "med-1").await.unwrap();
        assert!(record.decryption_failed);
        assert_eq!(record.fields["name"], json!(DECRYPTION_FAILED_PLACEHOLDER));
        assert_eq!(record.fields["unit"], json!("mg"));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (store, _cipher, _db) = setup().await;
        store.put(&EntityKind::Medication, "med-1", &medication(), Utc::now()).await.unwrap();

        assert!(store.remove(&EntityKind::Medication, "med-1").await.unwrap());
        assert!(!store.remove(&EntityKind::Medication, "med-1").await.unwrap());

        store.put(&EntityKind::Schedule, "s-1", &FieldMap::new(), Utc::now()).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let (_store, cipher, db) = setup().await;
        db.kv().put(OFFLINE_DATA_KEY, "[oops").await.unwrap();

        let reopened = OfflineStore::new(db.kv(), cipher);
        reopened.load().await.unwrap();
        assert!(reopened.is_empty().await);
    }
}
