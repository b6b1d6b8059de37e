//! # Remote Adapter
//!
//! The narrow interface between the engine and the remote document store.
//!
//! ## Boundary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Remote Adapter Boundary                            │
//! │                                                                         │
//! │  SyncEngine / ConflictResolver / AvailabilityTracker                   │
//! │       │                                                                 │
//! │       │  get / set / update / delete / query / batch_commit / ping      │
//! │       │  (each wrapped in tokio::time::timeout by the caller)          │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  dyn RemoteAdapter                                              │   │
//! │  │  Store SDK errors are translated to RemoteError HERE.           │   │
//! │  │  Nothing above this line sees a transport exception.            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  medications/{id}   doses/{id}   schedules/{id}   {custom}/{id}       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`MemoryRemote`] is an in-process implementation with failure injection,
//! used by tests and local development.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use medsync_core::{DocumentPath, FieldMap};

/// Default maximum number of writes in one `batch_commit`.
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Collection and document read by the default `ping`.
pub const HEALTH_COLLECTION: &str = "_health";
pub const HEALTH_DOCUMENT: &str = "ping";

// =============================================================================
// Errors
// =============================================================================

/// Remote store failures, classified for the scheduler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// The call did not complete within its time box.
    #[error("Remote call timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The store could not be reached.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The store aborted the request (contention, transaction retry).
    #[error("Remote request aborted: {0}")]
    Aborted(String),

    /// Security rules rejected the request.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The request was malformed for this store.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An update targeted a document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Anything else the adapter could not classify.
    #[error("Remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Returns true if the operation should stay queued and be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout { .. }
                | RemoteError::Unavailable(_)
                | RemoteError::Aborted(_)
                | RemoteError::Other(_)
        )
    }

    /// Returns true if the failure says the store is unreachable, as opposed
    /// to a reachable store refusing one request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Timeout { .. } | RemoteError::Unavailable(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Runs a remote call under a time box. Elapsing is a retryable
/// [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            after_ms: limit.as_millis() as u64,
        }),
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One write inside a `batch_commit`.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    /// Replace the whole document.
    Set { path: DocumentPath, fields: FieldMap },
    /// Merge fields into an existing document.
    Update { path: DocumentPath, fields: FieldMap },
    Delete { path: DocumentPath },
}

impl BatchWrite {
    pub fn path(&self) -> &DocumentPath {
        match self {
            BatchWrite::Set { path, .. }
            | BatchWrite::Update { path, .. }
            | BatchWrite::Delete { path } => path,
        }
    }
}

/// Equality filter for `query`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub field: String,
    pub value: Value,
}

impl QueryFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryFilter {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, fields: &FieldMap) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

/// A document returned by `query`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub fields: FieldMap,
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Remote document store.
///
/// Implementations translate their SDK's failures into [`RemoteError`].
/// Callers apply time boxes, so implementations need not.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Reads a document. `Ok(None)` when it does not exist.
    async fn get(&self, path: &DocumentPath) -> RemoteResult<Option<FieldMap>>;

    /// Creates or replaces a document.
    async fn set(&self, path: &DocumentPath, fields: FieldMap) -> RemoteResult<()>;

    /// Merges fields into an existing document.
    async fn update(&self, path: &DocumentPath, patch: FieldMap) -> RemoteResult<()>;

    async fn delete(&self, path: &DocumentPath) -> RemoteResult<()>;

    /// Lists documents in a collection matching every filter.
    async fn query(&self, collection: &str, filters: &[QueryFilter])
        -> RemoteResult<Vec<RemoteDocument>>;

    /// Applies up to [`batch_limit`](Self::batch_limit) writes atomically.
    async fn batch_commit(&self, writes: Vec<BatchWrite>) -> RemoteResult<()>;

    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    /// Trivial round trip used by availability probing.
    async fn ping(&self) -> RemoteResult<()> {
        self.get(&DocumentPath::new(HEALTH_COLLECTION, HEALTH_DOCUMENT))
            .await
            .map(|_| ())
    }
}

// =============================================================================
// In-memory Adapter
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<String, BTreeMap<String, FieldMap>>,
    offline: bool,
    latency: Option<Duration>,
    failures: VecDeque<RemoteError>,
    batch_sizes: Vec<usize>,
    calls: usize,
}

/// In-process document store.
///
/// Clones share the same documents. Failure injection:
/// - [`set_offline`](Self::set_offline): every call fails `Unavailable`
/// - [`fail_next`](Self::fail_next): the next calls fail with the given
///   errors, one per call, in order
/// - [`set_latency`](Self::set_latency): every call sleeps first
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
    batch_limit: Option<usize>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the advertised batch limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().failures.extend(errors);
    }

    /// Seeds a document without going through the failure hooks.
    pub fn insert_document(&self, path: &DocumentPath, fields: FieldMap) {
        self.lock()
            .collections
            .entry(path.collection.clone())
            .or_default()
            .insert(path.document_id.clone(), fields);
    }

    /// Reads a document without going through the failure hooks.
    pub fn document(&self, path: &DocumentPath) -> Option<FieldMap> {
        self.lock()
            .collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.document_id))
            .cloned()
    }

    /// Sizes of every committed batch, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Number of adapter calls made, including failed ones.
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    /// Applies the failure hooks for one call.
    async fn enter(&self) -> RemoteResult<()> {
        let latency = {
            let mut state = self.lock();
            state.calls += 1;
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.offline {
            return Err(RemoteError::Unavailable("remote is offline".into()));
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply(state: &mut MemoryState, write: BatchWrite) -> RemoteResult<()> {
        match write {
            BatchWrite::Set { path, fields } => {
                state
                    .collections
                    .entry(path.collection)
                    .or_default()
                    .insert(path.document_id, fields);
            }
            BatchWrite::Update { path, fields } => {
                let doc = state
                    .collections
                    .get_mut(&path.collection)
                    .and_then(|docs| docs.get_mut(&path.document_id))
                    .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
                for (name, value) in fields {
                    doc.insert(name, value);
                }
            }
            BatchWrite::Delete { path } => {
                if let Some(docs) = state.collections.get_mut(&path.collection) {
                    docs.remove(&path.document_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAdapter for MemoryRemote {
    async fn get(&self, path: &DocumentPath) -> RemoteResult<Option<FieldMap>> {
        self.enter().await?;
        Ok(self.document(path))
    }

    async fn set(&self, path: &DocumentPath, fields: FieldMap) -> RemoteResult<()> {
        self.enter().await?;
        Self::apply(
            &mut self.lock(),
            BatchWrite::Set {
                path: path.clone(),
                fields,
            },
        )
    }

    async fn update(&self, path: &DocumentPath, patch: FieldMap) -> RemoteResult<()> {
        self.enter().await?;
        Self::apply(
            &mut self.lock(),
            BatchWrite::Update {
                path: path.clone(),
                fields: patch,
            },
        )
    }

    async fn delete(&self, path: &DocumentPath) -> RemoteResult<()> {
        self.enter().await?;
        Self::apply(&mut self.lock(), BatchWrite::Delete { path: path.clone() })
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[QueryFilter],
    ) -> RemoteResult<Vec<RemoteDocument>> {
        self.enter().await?;
        let state = self.lock();
        let docs = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| filters.iter().all(|f| f.matches(fields)))
                    .map(|(id, fields)| RemoteDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }

    async fn batch_commit(&self, writes: Vec<BatchWrite>) -> RemoteResult<()> {
        self.enter().await?;

        if writes.len() > self.batch_limit() {
            return Err(RemoteError::InvalidArgument(format!(
                "batch of {} exceeds limit {}",
                writes.len(),
                self.batch_limit()
            )));
        }

        // All-or-nothing: apply to a scratch copy first
        let mut state = self.lock();
        let mut scratch = MemoryState {
            collections: state.collections.clone(),
            ..Default::default()
        };
        let count = writes.len();
        for write in writes {
            Self::apply(&mut scratch, write)?;
        }
        state.collections = scratch.collections;
        state.batch_sizes.push(count);
        Ok(())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit.unwrap_or(DEFAULT_BATCH_LIMIT)
    }
}
