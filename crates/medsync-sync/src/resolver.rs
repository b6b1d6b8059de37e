//! # Conflict Resolver
//!
//! Applies a [`ResolutionStrategy`] to one conflict against the remote
//! store and returns the record the local tiers should now hold.
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┬─────────────────────────────┐
//! │ Strategy     │ Remote write                │ Resulting local record      │
//! ├──────────────┼─────────────────────────────┼─────────────────────────────┤
//! │ UseLocal     │ update(local + updatedAt)   │ remote overlaid with local  │
//! │ UseRemote    │ none                        │ remote                      │
//! │ Merge(rules) │ set(merge_fields(..))       │ merged                      │
//! │ UseCustom(d) │ update(d + updatedAt)       │ remote overlaid with d      │
//! └──────────────┴─────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! A failed remote write leaves nothing applied; the caller keeps the
//! conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use medsync_core::{
    merge_fields, ConflictResolutionItem, DocumentPath, FieldMap, ResolutionStrategy,
    UPDATED_AT_FIELD,
};

use crate::error::SyncResult;
use crate::remote::{with_timeout, RemoteAdapter, RemoteError};

pub struct ConflictResolver {
    remote: Arc<dyn RemoteAdapter>,
    timeout: Duration,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    pub fn new(remote: Arc<dyn RemoteAdapter>, timeout: Duration) -> Self {
        ConflictResolver { remote, timeout }
    }

    /// Applies `strategy` and returns the resolved record.
    pub async fn apply(
        &self,
        item: &ConflictResolutionItem,
        strategy: &ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> SyncResult<FieldMap> {
        let path = item.operation.document_path();
        let remote = &item.conflict_data.remote_data;

        let resolved = match strategy {
            ResolutionStrategy::UseLocal => {
                self.overwrite(&path, remote, &item.conflict_data.local_data, now)
                    .await?
            }
            ResolutionStrategy::UseRemote => remote.clone(),
            ResolutionStrategy::Merge(rules) => {
                let merged = merge_fields(&item.conflict_data.local_data, remote, rules, now);
                with_timeout(self.timeout, self.remote.set(&path, merged.clone())).await?;
                merged
            }
            ResolutionStrategy::UseCustom(data) => {
                self.overwrite(&path, remote, data, now).await?
            }
        };

        info!(
            conflict_id = %item.id,
            path = %path,
            strategy = %strategy,
            "Conflict resolved"
        );
        Ok(resolved)
    }

    /// Writes `fields` over the remote document. Falls back to a full set
    /// when the document has been deleted since the conflict was raised.
    async fn overwrite(
        &self,
        path: &DocumentPath,
        remote: &FieldMap,
        fields: &FieldMap,
        now: DateTime<Utc>,
    ) -> SyncResult<FieldMap> {
        let mut patch = fields.clone();
        patch.insert(UPDATED_AT_FIELD.to_string(), Value::String(now.to_rfc3339()));

        let mut resolved = remote.clone();
        for (name, value) in &patch {
            resolved.insert(name.clone(), value.clone());
        }

        match with_timeout(self.timeout, self.remote.update(path, patch)).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => {
                debug!(path = %path, "Conflicting document is gone, recreating it");
                with_timeout(self.timeout, self.remote.set(path, resolved.clone())).await?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(resolved)
    }
}
