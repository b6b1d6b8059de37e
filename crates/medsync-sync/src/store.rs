//! # Persisted Sync State
//!
//! Snapshots of the operation queue and conflict queue in the key/value
//! table, one encrypted element per entry.
//!
//! ```text
//! pending_sync_operations    ["<sealed op>", "<sealed op>", ...]
//! conflict_resolution_queue  ["<sealed item>", ...]
//! last_sync_timestamp        "1718000000000"
//! ```
//!
//! An element that fails to decrypt or parse is skipped on load and logged.
//! The rest of the snapshot still loads.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use medsync_core::{ConflictResolutionItem, SyncOperation};
use medsync_db::KvRepository;

use crate::crypto::EncryptionProvider;
use crate::error::SyncResult;

pub const PENDING_OPERATIONS_KEY: &str = "pending_sync_operations";
pub const CONFLICT_QUEUE_KEY: &str = "conflict_resolution_queue";
pub const LAST_SYNC_KEY: &str = "last_sync_timestamp";

pub struct StateStore {
    kv: KvRepository,
    crypto: Arc<dyn EncryptionProvider>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new(kv: KvRepository, crypto: Arc<dyn EncryptionProvider>) -> Self {
        StateStore { kv, crypto }
    }

    pub async fn load_operations(&self) -> SyncResult<Vec<SyncOperation>> {
        self.load_sealed(PENDING_OPERATIONS_KEY).await
    }

    pub async fn save_operations<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a SyncOperation>,
    ) -> SyncResult<()> {
        self.save_sealed(PENDING_OPERATIONS_KEY, ops).await
    }

    pub async fn load_conflicts(&self) -> SyncResult<Vec<ConflictResolutionItem>> {
        self.load_sealed(CONFLICT_QUEUE_KEY).await
    }

    pub async fn save_conflicts<'a>(
        &self,
        items: impl IntoIterator<Item = &'a ConflictResolutionItem>,
    ) -> SyncResult<()> {
        self.save_sealed(CONFLICT_QUEUE_KEY, items).await
    }

    pub async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.kv.get(LAST_SYNC_KEY).await? else {
            return Ok(None);
        };
        let parsed = raw
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        if parsed.is_none() {
            warn!(value = %raw, "Ignoring malformed last sync timestamp");
        }
        Ok(parsed)
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.kv
            .put(LAST_SYNC_KEY, &at.timestamp_millis().to_string())
            .await?;
        Ok(())
    }

    async fn load_sealed<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Vec<T>> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(Vec::new());
        };

        let sealed: Vec<String> = match serde_json::from_str(&raw) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(key = %key, error = %e, "Persisted snapshot is corrupt, starting empty");
                return Ok(Vec::new());
            }
        };

        let total = sealed.len();
        let items: Vec<T> = sealed
            .iter()
            .enumerate()
            .filter_map(|(index, element)| match self.open(element) {
                Ok(item) => Some(item),
                Err(reason) => {
                    warn!(key = %key, index, reason = %reason, "Skipping unreadable persisted entry");
                    None
                }
            })
            .collect();

        debug!(key = %key, loaded = items.len(), total, "Loaded persisted snapshot");
        Ok(items)
    }

    fn open<T: DeserializeOwned>(&self, element: &str) -> Result<T, String> {
        let plain = self.crypto.decrypt(element).map_err(|e| e.to_string())?;
        serde_json::from_str(&plain).map_err(|e| e.to_string())
    }

    async fn save_sealed<'a, T: Serialize + 'a>(
        &self,
        key: &str,
        items: impl IntoIterator<Item = &'a T>,
    ) -> SyncResult<()> {
        let mut sealed = Vec::new();
        for item in items {
            let plain = serde_json::to_string(item)?;
            sealed.push(self.crypto.encrypt(&plain)?);
        }

        self.kv.put(key, &serde_json::to_string(&sealed)?).await?;
        Ok(())
    }
}
