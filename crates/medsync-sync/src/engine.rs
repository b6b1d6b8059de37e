//! # Sync Engine
//!
//! Orchestrates local writes, sync passes, and conflict resolution.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEngine Architecture                          │
//! │                                                                         │
//! │   write(op) ──► TieredCache + OfflineStore ──► OperationQueue           │
//! │                   (visible immediately)          (persisted, sealed)    │
//! │                                                       │                 │
//! │   sync timer ─┐                                       ▼                 │
//! │   sign-in ────┼──► trigger_sync() ──► one pass at a time (PassGuard)    │
//! │   back online ┘                          │                              │
//! │                                          ├─ fetch each document once    │
//! │                                          ├─ detect conflicts            │
//! │                                          ├─ batch_commit in chunks      │
//! │                                          └─ apply outcomes, persist     │
//! │                                                                         │
//! │   subscribe_status()    ──► watch<SyncStatus>                           │
//! │   subscribe_conflicts() ──► watch<Vec<ConflictResolutionItem>>          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pass Outcomes
//! ```text
//! ┌───────────────┬──────────────────────────────────────────────────────┐
//! │ Committed     │ removed from the queue                               │
//! │ Conflicted    │ removed, pushed onto the conflict queue              │
//! │ Retryable     │ retry_count + 1 with backoff, dropped at max_retries │
//! │ Terminal      │ removed and logged                                   │
//! │ Deferred      │ untouched; an earlier op on the document is pending  │
//! └───────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Background Tasks
//! All owned by the engine and stopped by [`SyncEngine::shutdown`]:
//! - sync timer, running only while a user is signed in
//! - cache cleanup sweep
//! - auth/availability event loop

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use medsync_core::conflict::remote_updated_at;
use medsync_core::validation::validate_operation;
use medsync_core::{
    Clock, ConflictResolutionItem, CoreResult, DocumentPath, EntityKind, EntityPayload, FieldMap,
    ResolutionStrategy, SyncAction, SyncOperation, SystemClock, UserId, CREATED_AT_FIELD,
    UPDATED_AT_FIELD,
};
use medsync_db::{Database, DbConfig};

use crate::auth::AuthProvider;
use crate::availability::AvailabilityTracker;
use crate::cache::TieredCache;
use crate::config::SyncConfig;
use crate::crypto::{DbKeyStore, EncryptionProvider, FieldCipher};
use crate::error::{SyncError, SyncResult};
use crate::offline::{OfflineRecord, OfflineStore};
use crate::queue::{retry_delay, OperationQueue};
use crate::remote::{with_timeout, BatchWrite, QueryFilter, RemoteAdapter, RemoteError};
use crate::resolver::ConflictResolver;
use crate::scheduler::{FirstTick, ScheduledTask, TaskControl};
use crate::status::{
    ForceSyncResult, OperationOutcome, SyncOutcome, SyncState, SyncStatus, SyncSummary,
};
use crate::store::StateStore;

/// Owner stamp written on every remote document and used to scope queries.
pub const USER_ID_FIELD: &str = "userId";

// =============================================================================
// Engine State
// =============================================================================

/// Queue and conflict state. Every mutation goes through the engine's
/// single async mutex.
#[derive(Debug)]
struct QueueState {
    queue: OperationQueue,
    conflicts: Vec<ConflictResolutionItem>,
    /// Conflict ids with a resolution in flight.
    resolving: HashSet<String>,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct EngineTasks {
    event_loop: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    sync_timer: Option<ScheduledTask>,
    cleanup: Option<ScheduledTask>,
}

struct EngineInner {
    config: SyncConfig,
    remote: Arc<dyn RemoteAdapter>,
    auth: Arc<dyn AuthProvider>,
    crypto: Arc<dyn EncryptionProvider>,
    clock: Arc<dyn Clock>,

    cache: TieredCache,
    offline: OfflineStore,
    store: StateStore,
    availability: AvailabilityTracker,
    resolver: ConflictResolver,

    state: Mutex<QueueState>,
    is_syncing: AtomicBool,
    started: AtomicBool,
    shutting_down: AtomicBool,
    lifecycle: Mutex<()>,

    status_tx: watch::Sender<SyncStatus>,
    conflicts_tx: watch::Sender<Vec<ConflictResolutionItem>>,
    tasks: StdMutex<EngineTasks>,
}

/// Marks a pass as running for as long as it is alive.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`SyncEngine`] from explicit collaborators.
///
/// A remote adapter and an auth provider are required. The database
/// defaults to `storage.database_path`, encryption to a [`FieldCipher`]
/// keyed from the database's secret table, and the clock to wall time.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    database: Option<Database>,
    remote: Option<Arc<dyn RemoteAdapter>>,
    auth: Option<Arc<dyn AuthProvider>>,
    encryption: Option<Arc<dyn EncryptionProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncEngineBuilder {
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn remote(mut self, remote: impl RemoteAdapter + 'static) -> Self {
        self.remote = Some(Arc::new(remote));
        self
    }

    pub fn auth(mut self, auth: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn encryption(mut self, encryption: impl EncryptionProvider + 'static) -> Self {
        self.encryption = Some(Arc::new(encryption));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Validates the configuration and wires the components together.
    /// Nothing runs until [`SyncEngine::start`].
    pub async fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("a remote adapter is required".into()))?;
        let auth = self
            .auth
            .ok_or_else(|| SyncError::InvalidConfig("an auth provider is required".into()))?;

        let db = match self.database {
            Some(db) => db,
            None => Database::new(DbConfig::new(config.storage.database_path.clone())).await?,
        };

        let crypto: Arc<dyn EncryptionProvider> = match self.encryption {
            Some(crypto) => crypto,
            None => Arc::new(FieldCipher::new(DbKeyStore::new(db.secrets()))),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let cache = TieredCache::new(
            db.cache(),
            crypto.clone(),
            clock.clone(),
            config.default_ttl(),
        );
        let offline = OfflineStore::new(db.kv(), crypto.clone());
        let store = StateStore::new(db.kv(), crypto.clone());
        let availability = AvailabilityTracker::new(
            remote.clone(),
            db.kv(),
            config.probe_timeout(),
            config.reprobe_interval(),
        );
        let resolver = ConflictResolver::new(remote.clone(), config.operation_timeout());

        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (conflicts_tx, _) = watch::channel(Vec::new());
        let queue = OperationQueue::new(config.queue.max_queue_size);

        info!(
            max_queue_size = config.queue.max_queue_size,
            max_retries = config.queue.max_retries,
            sync_interval_secs = config.sync.sync_interval_secs,
            "Sync engine built"
        );

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                config,
                remote,
                auth,
                crypto,
                clock,
                cache,
                offline,
                store,
                availability,
                resolver,
                state: Mutex::new(QueueState {
                    queue,
                    conflicts: Vec::new(),
                    resolving: HashSet::new(),
                    last_sync_at: None,
                    last_error: None,
                }),
                is_syncing: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                status_tx,
                conflicts_tx,
                tasks: StdMutex::new(EngineTasks::default()),
            }),
        })
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Offline-first sync engine. Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("is_syncing", &self.inner.is_syncing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            database: None,
            remote: None,
            auth: None,
            encryption: None,
            clock: None,
        }
    }

    fn from_weak(weak: &Weak<EngineInner>) -> Option<SyncEngine> {
        weak.upgrade().map(|inner| SyncEngine { inner })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads persisted state and starts background work. Idempotent.
    ///
    /// ## Startup Order
    /// 1. Encryption keys
    /// 2. Availability flag, offline data, queue, conflicts
    /// 3. Expired cache sweep and the periodic cleanup task
    /// 4. Availability probe
    /// 5. If signed in: sync timer plus one pass right away
    /// 6. Auth/availability event loop
    pub async fn start(&self) -> SyncResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            debug!("Sync engine already started");
            return Ok(());
        }

        info!("Starting sync engine");

        self.inner.crypto.initialize().await?;
        self.inner.availability.load().await;
        self.inner.offline.load().await?;

        let ops = self.inner.store.load_operations().await?;
        let conflicts = self.inner.store.load_conflicts().await?;
        let last_sync_at = self.inner.store.last_sync().await?;
        {
            let mut state = self.inner.state.lock().await;
            state.queue = OperationQueue::from_snapshot(ops, self.inner.config.queue.max_queue_size);
            state.conflicts = conflicts;
            state.last_sync_at = last_sync_at;
            info!(
                pending = state.queue.len(),
                conflicts = state.conflicts.len(),
                "Restored sync state"
            );
            self.inner.conflicts_tx.send_replace(state.conflicts.clone());
        }

        let swept = self.inner.cache.clean_expired_entries().await;
        debug!(removed = swept, "Startup cache sweep complete");
        self.spawn_cleanup_task();

        let probe_timeout = self.inner.config.probe_timeout();
        let reachable = self.inner.availability.probe(probe_timeout).await;
        debug!(reachable, "Startup availability probe complete");

        self.inner.started.store(true, Ordering::SeqCst);

        if self.inner.auth.current_user_id().is_some() {
            self.restart_sync_timer(FirstTick::AfterPeriod).await;
            match self.trigger_sync().await {
                Ok(outcome) => debug!(?outcome, "Startup sync pass finished"),
                Err(e) => warn!(error = %e, "Startup sync pass failed"),
            }
        }

        self.spawn_event_loop();
        self.refresh_status().await;

        info!("Sync engine started");
        Ok(())
    }

    /// Stops every background task and publishes [`SyncState::Stopped`].
    ///
    /// A pass already in flight finishes on its own. Idempotent.
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down sync engine");

        let (event_loop, sync_timer, cleanup) = {
            let mut tasks = self.lock_tasks();
            (
                tasks.event_loop.take(),
                tasks.sync_timer.take(),
                tasks.cleanup.take(),
            )
        };

        if let Some((stop_tx, handle)) = event_loop {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Sync event loop panicked");
                }
            }
        }
        if let Some(task) = sync_timer {
            task.stop().await;
        }
        if let Some(task) = cleanup {
            task.stop().await;
        }
        self.inner.availability.shutdown().await;

        self.refresh_status().await;
        info!("Sync engine stopped");
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(SyncError::NotStarted);
        }
        Ok(())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, EngineTasks> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    fn spawn_cleanup_task(&self) {
        let weak = Arc::downgrade(&self.inner);
        let task = ScheduledTask::spawn(
            "cache-cleanup",
            self.inner.config.cleanup_interval(),
            FirstTick::AfterPeriod,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(engine) = SyncEngine::from_weak(&weak) else {
                        return TaskControl::Stop;
                    };
                    let removed = engine.inner.cache.clean_expired_entries().await;
                    debug!(removed, "Periodic cache sweep complete");
                    TaskControl::Continue
                }
            },
        );

        self.lock_tasks().cleanup = Some(task);
    }

    /// Replaces the sync timer. The previous timer is stopped first.
    async fn restart_sync_timer(&self, first: FirstTick) {
        self.stop_sync_timer().await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let task = ScheduledTask::spawn(
            "sync-timer",
            self.inner.config.sync_interval(),
            first,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(engine) = SyncEngine::from_weak(&weak) else {
                        return TaskControl::Stop;
                    };
                    match engine.trigger_sync().await {
                        Ok(outcome) => {
                            debug!(?outcome, "Scheduled sync pass finished");
                            TaskControl::Continue
                        }
                        Err(SyncError::ShuttingDown) => TaskControl::Stop,
                        Err(e) => {
                            warn!(error = %e, "Scheduled sync pass failed");
                            TaskControl::Continue
                        }
                    }
                }
            },
        );

        self.lock_tasks().sync_timer = Some(task);
    }

    async fn stop_sync_timer(&self) {
        let task = self.lock_tasks().sync_timer.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    fn spawn_event_loop(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut auth_rx = self.inner.auth.subscribe();
        let mut avail_rx = self.inner.availability.subscribe();
        auth_rx.borrow_and_update();
        avail_rx.borrow_and_update();

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,

                    changed = auth_rx.changed() => {
                        if changed.is_err() {
                            debug!("Auth provider closed, event loop exiting");
                            break;
                        }
                        let user = auth_rx.borrow_and_update().clone();
                        let Some(engine) = SyncEngine::from_weak(&weak) else { break };
                        engine.on_auth_changed(user).await;
                    }

                    changed = avail_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let available = *avail_rx.borrow_and_update();
                        let Some(engine) = SyncEngine::from_weak(&weak) else { break };
                        engine.on_availability_changed(available).await;
                    }
                }
            }
            debug!("Sync event loop stopped");
        });

        if let Some((old_tx, _)) = self.lock_tasks().event_loop.replace((stop_tx, handle)) {
            let _ = old_tx.send(true);
        }
    }

    async fn on_auth_changed(&self, user: Option<UserId>) {
        match user {
            Some(user_id) => {
                info!(user_id = %user_id, "Signed in, resuming sync");
                self.restart_sync_timer(FirstTick::Immediately).await;
            }
            None => {
                info!("Signed out, pausing sync");
                self.stop_sync_timer().await;
            }
        }
        self.refresh_status().await;
    }

    async fn on_availability_changed(&self, available: bool) {
        self.refresh_status().await;
        if available && self.inner.auth.current_user_id().is_some() {
            match self.trigger_sync().await {
                Ok(outcome) => debug!(?outcome, "Reconnect sync pass finished"),
                Err(e) => debug!(error = %e, "Reconnect sync pass skipped"),
            }
        }
    }

    // =========================================================================
    // Local Writes and Reads
    // =========================================================================

    /// Applies an operation locally and queues it for the remote store.
    ///
    /// The record is readable right away. Returns the operation id.
    pub async fn write(&self, op: SyncOperation) -> SyncResult<String> {
        self.ensure_running()?;
        if self.inner.auth.current_user_id().is_none() {
            return Err(SyncError::NotAuthenticated);
        }
        validate_operation(&op)?;

        let now = self.inner.clock.now();
        let op_id = op.id.clone();
        {
            let mut state = self.inner.state.lock().await;
            self.apply_local(&op, now).await?;
            state.queue.enqueue(op);
            self.persist_operations(&state).await;
            self.publish_status(&state);
        }

        if self.inner.config.sync.sync_on_write && self.inner.availability.is_available() {
            let engine = self.clone();
            tokio::spawn(async move {
                match engine.trigger_sync().await {
                    Ok(outcome) => debug!(?outcome, "Write-triggered sync pass finished"),
                    Err(e) => debug!(error = %e, "Write-triggered sync pass skipped"),
                }
            });
        }

        Ok(op_id)
    }

    pub async fn create(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> SyncResult<String> {
        let op = SyncOperation::create(entity_id, payload, self.inner.clock.now());
        self.write(op).await
    }

    pub async fn update(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> SyncResult<String> {
        let op = SyncOperation::update(entity_id, payload, self.inner.clock.now());
        self.write(op).await
    }

    pub async fn delete(
        &self,
        kind: &EntityKind,
        entity_id: impl Into<String>,
    ) -> SyncResult<String> {
        let op = SyncOperation::delete(kind, entity_id, self.inner.clock.now());
        self.write(op).await
    }

    async fn apply_local(&self, op: &SyncOperation, now: DateTime<Utc>) -> SyncResult<()> {
        let kind = &op.entity_kind;
        let key = cache_key(kind, &op.entity_id);

        if op.action == SyncAction::Delete {
            self.inner.cache.remove(&key).await;
            self.inner.offline.remove(kind, &op.entity_id).await?;
            return Ok(());
        }

        let mut fields = match op.action {
            SyncAction::Update => self
                .local_record(kind, &op.entity_id)
                .await
                .unwrap_or_default(),
            _ => FieldMap::new(),
        };
        fields.extend(op.payload.to_fields()?);
        fields.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(op.created_at.to_rfc3339()),
        );

        self.inner.cache.set(&key, &fields, None).await?;
        self.inner.offline.put(kind, &op.entity_id, &fields, now).await
    }

    async fn local_record(&self, kind: &EntityKind, id: &str) -> Option<FieldMap> {
        if let Some(fields) = self.inner.cache.get::<FieldMap>(&cache_key(kind, id), true).await {
            return Some(fields);
        }
        self.inner
            .offline
            .get(kind, id)
            .await
            .filter(|record| !record.decryption_failed)
            .map(|record| record.fields)
    }

    /// Reads the local copy of a record: cache first, then offline data.
    pub async fn read(&self, kind: &EntityKind, id: &str) -> Option<FieldMap> {
        let key = cache_key(kind, id);
        if let Some(fields) = self.inner.cache.get::<FieldMap>(&key, false).await {
            return Some(fields);
        }

        let record = self.inner.offline.get(kind, id).await?;
        if !record.decryption_failed {
            if let Err(e) = self.inner.cache.set(&key, &record.fields, None).await {
                debug!(key = %key, error = %e, "Could not promote offline record into cache");
            }
        }
        Some(record.fields)
    }

    /// Every offline record of a kind. Undecryptable records carry
    /// placeholders and `decryption_failed`.
    pub async fn records(&self, kind: &EntityKind) -> Vec<OfflineRecord> {
        self.inner.offline.list(kind).await
    }

    /// Pulls the signed-in user's documents of one kind into local storage.
    ///
    /// Documents with a pending operation or an open conflict keep their
    /// local version. Returns how many documents were stored.
    pub async fn refresh_collection(
        &self,
        kind: &EntityKind,
        mut filters: Vec<QueryFilter>,
    ) -> SyncResult<usize> {
        self.ensure_running()?;
        let user_id = self
            .inner
            .auth
            .current_user_id()
            .ok_or(SyncError::NotAuthenticated)?;
        if !self.inner.availability.is_available() {
            return Err(RemoteError::Unavailable("remote store is marked unavailable".into()).into());
        }

        filters.push(QueryFilter::eq(USER_ID_FIELD, user_id));
        let collection = kind.collection();
        let timeout = self.inner.config.operation_timeout();

        let docs = match with_timeout(timeout, self.inner.remote.query(&collection, &filters)).await {
            Ok(docs) => docs,
            Err(e) => {
                if e.is_connectivity() {
                    self.inner.availability.set_available(false).await;
                    self.refresh_status().await;
                }
                return Err(e.into());
            }
        };

        let now = self.inner.clock.now();
        let state = self.inner.state.lock().await;
        let mut stored = 0;
        for doc in docs {
            let has_conflict = state.conflicts.iter().any(|item| {
                item.operation.entity_id == doc.id
                    && item.operation.entity_kind.collection() == collection
            });
            if has_conflict || state.queue.touches(&collection, &doc.id) {
                debug!(collection = %collection, id = %doc.id, "Keeping local version with pending changes");
                continue;
            }

            self.inner
                .cache
                .set(&cache_key(kind, &doc.id), &doc.fields, None)
                .await?;
            self.inner.offline.put(kind, &doc.id, &doc.fields, now).await?;
            stored += 1;
        }

        info!(collection = %collection, stored, "Refreshed collection from remote");
        Ok(stored)
    }

    // =========================================================================
    // Sync Passes
    // =========================================================================

    /// Runs one pass unless one is already running, nobody is signed in, or
    /// the remote store is marked unavailable.
    pub async fn trigger_sync(&self) -> SyncResult<SyncOutcome> {
        self.ensure_running()?;

        let Some(guard) = PassGuard::acquire(&self.inner.is_syncing) else {
            debug!("Sync pass already running");
            return Ok(SyncOutcome::AlreadySyncing);
        };
        let Some(user_id) = self.inner.auth.current_user_id() else {
            return Ok(SyncOutcome::NotAuthenticated);
        };
        if !self.inner.availability.is_available() {
            debug!("Remote store unavailable, skipping sync pass");
            return Ok(SyncOutcome::Offline);
        }

        let summary = self.run_pass(&user_id).await;
        drop(guard);
        self.refresh_status().await;
        Ok(SyncOutcome::Completed(summary))
    }

    /// Runs one pass now and reports what it did.
    ///
    /// When the remote store is marked unavailable, a quick probe decides
    /// whether to go ahead.
    pub async fn force_sync(&self) -> SyncResult<ForceSyncResult> {
        self.ensure_running()?;

        let Some(guard) = PassGuard::acquire(&self.inner.is_syncing) else {
            return Ok(ForceSyncResult::not_run("Sync already in progress"));
        };
        let Some(user_id) = self.inner.auth.current_user_id() else {
            return Ok(ForceSyncResult::not_run("Not authenticated"));
        };
        if !self.inner.availability.is_available() {
            let timeout = self.inner.config.quick_retry_timeout();
            if !self.inner.availability.probe(timeout).await {
                drop(guard);
                self.refresh_status().await;
                return Ok(ForceSyncResult::not_run("Remote store is unreachable"));
            }
        }

        info!("Forced sync pass requested");
        let summary = self.run_pass(&user_id).await;
        drop(guard);
        self.refresh_status().await;
        Ok(ForceSyncResult::from_summary(&summary))
    }

    /// One pass over every due operation. The caller holds the pass guard.
    async fn run_pass(&self, user_id: &str) -> SyncSummary {
        let due = {
            let state = self.inner.state.lock().await;
            let due = state.queue.due(self.inner.clock.now());
            self.publish_status(&state);
            due
        };

        debug!(due = due.len(), "Sync pass started");

        let fetched = self.fetch_documents(&due).await;
        let (mut outcomes, planned, mut connectivity_lost) = self.plan_writes(&due, &fetched, user_id);
        connectivity_lost |= self.commit_writes(planned, &mut outcomes, connectivity_lost).await;

        let summary = self.apply_outcomes(&due, outcomes).await;

        if connectivity_lost {
            self.inner.availability.set_available(false).await;
        }

        info!(
            processed = summary.processed,
            committed = summary.committed,
            conflicts = summary.conflicts,
            retried = summary.retried,
            dropped = summary.dropped,
            deferred = summary.deferred,
            "Sync pass finished"
        );
        summary
    }

    /// Fetches each distinct document once, with bounded concurrency.
    async fn fetch_documents(
        &self,
        due: &[SyncOperation],
    ) -> HashMap<DocumentPath, Result<Option<FieldMap>, RemoteError>> {
        let mut seen = HashSet::new();
        let paths: Vec<DocumentPath> = due
            .iter()
            .map(SyncOperation::document_path)
            .filter(|path| seen.insert(path.clone()))
            .collect();

        let timeout = self.inner.config.operation_timeout();
        let concurrency = self.inner.config.sync.max_concurrent_fetches.max(1);
        let remote = self.inner.remote.clone();

        stream::iter(paths)
            .map(|path| {
                let remote = remote.clone();
                async move {
                    let result = with_timeout(timeout, remote.get(&path)).await;
                    (path, result)
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Decides each operation's fate in FIFO order.
    ///
    /// Later operations on a document see the writes planned by earlier
    /// ones. Once an operation on a document fails or conflicts, the rest
    /// on that document are deferred.
    fn plan_writes(
        &self,
        due: &[SyncOperation],
        fetched: &HashMap<DocumentPath, Result<Option<FieldMap>, RemoteError>>,
        user_id: &str,
    ) -> (HashMap<String, OperationOutcome>, Vec<(String, BatchWrite)>, bool) {
        let policy = &self.inner.config.conflict;
        let mut outcomes = HashMap::new();
        let mut planned = Vec::new();
        let mut documents: HashMap<DocumentPath, Option<FieldMap>> = HashMap::new();
        let mut blocked: HashSet<DocumentPath> = HashSet::new();
        let mut connectivity_lost = false;

        for op in due {
            let path = op.document_path();
            if blocked.contains(&path) {
                outcomes.insert(op.id.clone(), OperationOutcome::Deferred);
                continue;
            }

            let current = match documents.get(&path) {
                Some(doc) => doc.clone(),
                None => match fetched.get(&path) {
                    Some(Ok(doc)) => doc.clone(),
                    Some(Err(e)) => {
                        connectivity_lost |= e.is_connectivity();
                        debug!(op_id = %op.id, path = %path, error = %e, "Fetch failed");
                        outcomes.insert(op.id.clone(), classify(e));
                        blocked.insert(path);
                        continue;
                    }
                    None => {
                        outcomes.insert(op.id.clone(), OperationOutcome::Deferred);
                        blocked.insert(path);
                        continue;
                    }
                },
            };

            if let Some(remote_doc) = &current {
                match policy.detect(op, remote_doc) {
                    Ok(None) => {}
                    Ok(Some(data)) => {
                        outcomes.insert(op.id.clone(), OperationOutcome::Conflicted(Box::new(data)));
                        blocked.insert(path);
                        continue;
                    }
                    Err(e) => {
                        outcomes.insert(op.id.clone(), OperationOutcome::Terminal(e.to_string()));
                        blocked.insert(path);
                        continue;
                    }
                }
            }

            match build_write(op, current.as_ref(), user_id) {
                Ok((write, next)) => {
                    documents.insert(path, next);
                    planned.push((op.id.clone(), write));
                }
                Err(e) => {
                    outcomes.insert(op.id.clone(), OperationOutcome::Terminal(e.to_string()));
                    blocked.insert(path);
                }
            }
        }

        (outcomes, planned, connectivity_lost)
    }

    /// Commits planned writes in chunks no larger than the adapter allows.
    /// Returns true if connectivity was lost along the way.
    async fn commit_writes(
        &self,
        planned: Vec<(String, BatchWrite)>,
        outcomes: &mut HashMap<String, OperationOutcome>,
        mut connectivity_lost: bool,
    ) -> bool {
        let chunk_size = self
            .inner
            .remote
            .batch_limit()
            .min(self.inner.config.sync.batch_size)
            .max(1);
        let timeout = self.inner.config.operation_timeout();
        let mut failed_paths: HashSet<DocumentPath> = HashSet::new();
        let mut remaining: VecDeque<(String, BatchWrite)> = planned.into();

        while !remaining.is_empty() {
            let mut chunk = Vec::with_capacity(chunk_size);
            while chunk.len() < chunk_size {
                let Some((op_id, write)) = remaining.pop_front() else {
                    break;
                };
                if connectivity_lost || failed_paths.contains(write.path()) {
                    outcomes.insert(op_id, OperationOutcome::Deferred);
                } else {
                    chunk.push((op_id, write));
                }
            }
            if chunk.is_empty() {
                continue;
            }

            let writes: Vec<BatchWrite> = chunk.iter().map(|(_, write)| write.clone()).collect();
            let size = writes.len();
            match with_timeout(timeout, self.inner.remote.batch_commit(writes)).await {
                Ok(()) => {
                    debug!(size, "Batch committed");
                    for (op_id, _) in chunk {
                        outcomes.insert(op_id, OperationOutcome::Committed);
                    }
                }
                Err(e) => {
                    warn!(size, error = %e, "Batch commit failed");
                    connectivity_lost |= e.is_connectivity();
                    for (op_id, write) in chunk {
                        failed_paths.insert(write.path().clone());
                        outcomes.insert(op_id, classify(&e));
                    }
                }
            }
        }

        connectivity_lost
    }

    /// Applies outcomes to the queue, persists, and publishes.
    async fn apply_outcomes(
        &self,
        due: &[SyncOperation],
        mut outcomes: HashMap<String, OperationOutcome>,
    ) -> SyncSummary {
        let now = self.inner.clock.now();
        let base_delay = self.inner.config.retry_delay();
        let max_retries = self.inner.config.queue.max_retries;

        let mut summary = SyncSummary::default();
        let mut new_conflicts = Vec::new();
        let mut last_error = None;

        let mut state = self.inner.state.lock().await;
        for op in due {
            let outcome = outcomes.remove(&op.id).unwrap_or(OperationOutcome::Deferred);
            summary.record(&outcome);

            match outcome {
                OperationOutcome::Committed => {
                    state.queue.remove(&op.id);
                    debug!(op_id = %op.id, path = %op.document_path(), "Operation committed");
                }
                OperationOutcome::Conflicted(data) => {
                    state.queue.remove(&op.id);
                    let item = ConflictResolutionItem::new(op.clone(), *data, now);
                    info!(
                        conflict_id = %item.id,
                        path = %op.document_path(),
                        fields = ?item.conflict_data.conflicting_fields,
                        "Conflict detected"
                    );
                    new_conflicts.push(item);
                }
                OperationOutcome::Retryable(e) => {
                    let exhausted = match state.queue.get_mut(&op.id) {
                        Some(queued) => {
                            let delay = retry_delay(base_delay, queued.retry_count + 1);
                            let next = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                            queued.record_failure(e.to_string(), next);
                            queued.is_exhausted(max_retries)
                        }
                        None => false,
                    };

                    if exhausted {
                        state.queue.remove(&op.id);
                        summary.dropped += 1;
                        warn!(
                            op_id = %op.id,
                            path = %op.document_path(),
                            max_retries,
                            error = %e,
                            "Operation dropped after final retry"
                        );
                    } else {
                        summary.retried += 1;
                        debug!(op_id = %op.id, error = %e, "Operation will be retried");
                    }
                    last_error = Some(e.to_string());
                }
                OperationOutcome::Terminal(reason) => {
                    state.queue.remove(&op.id);
                    warn!(op_id = %op.id, path = %op.document_path(), reason = %reason, "Operation failed permanently");
                    last_error = Some(reason);
                }
                OperationOutcome::Deferred => {}
            }
        }

        let has_new_conflicts = !new_conflicts.is_empty();
        state.conflicts.extend(new_conflicts);
        state.last_sync_at = Some(now);
        state.last_error = last_error;

        self.persist_operations(&state).await;
        if has_new_conflicts {
            self.persist_conflicts(&state).await;
            self.inner.conflicts_tx.send_replace(state.conflicts.clone());
        }
        if let Err(e) = self.inner.store.set_last_sync(now).await {
            error!(error = %e, "Failed to persist last sync timestamp");
        }

        summary
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Applies a strategy to one open conflict.
    ///
    /// On success the resolved record replaces the local copy and the
    /// conflict is closed. On failure the conflict stays open. A conflict
    /// already being resolved by another call is rejected with
    /// [`SyncError::ResolutionInProgress`].
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> SyncResult<FieldMap> {
        self.ensure_running()?;
        if self.inner.auth.current_user_id().is_none() {
            return Err(SyncError::NotAuthenticated);
        }

        let item = {
            let mut state = self.inner.state.lock().await;
            let Some(item) = state.conflicts.iter().find(|item| item.id == conflict_id).cloned()
            else {
                return Err(SyncError::ConflictNotFound {
                    id: conflict_id.to_string(),
                });
            };
            if !state.resolving.insert(conflict_id.to_string()) {
                return Err(SyncError::ResolutionInProgress {
                    id: conflict_id.to_string(),
                });
            }
            item
        };

        let now = self.inner.clock.now();
        let resolved = match self.inner.resolver.apply(&item, &strategy, now).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(conflict_id = %conflict_id, error = %e, "Conflict resolution failed");
                self.inner.state.lock().await.resolving.remove(conflict_id);
                if matches!(&e, SyncError::Remote(remote) if remote.is_connectivity()) {
                    self.inner.availability.set_available(false).await;
                    self.refresh_status().await;
                }
                return Err(e);
            }
        };

        let kind = &item.operation.entity_kind;
        let id = &item.operation.entity_id;
        let mut state = self.inner.state.lock().await;

        if let Err(e) = self.inner.cache.set(&cache_key(kind, id), &resolved, None).await {
            warn!(error = %e, "Could not cache resolved record");
        }
        if let Err(e) = self.inner.offline.put(kind, id, &resolved, now).await {
            warn!(error = %e, "Could not store resolved record offline");
        }

        state.conflicts.retain(|c| c.id != conflict_id);
        state.resolving.remove(conflict_id);
        self.persist_conflicts(&state).await;
        self.inner.conflicts_tx.send_replace(state.conflicts.clone());
        self.publish_status(&state);

        Ok(resolved)
    }

    pub async fn conflicts(&self) -> Vec<ConflictResolutionItem> {
        self.inner.state.lock().await.conflicts.clone()
    }

    pub fn subscribe_conflicts(&self) -> watch::Receiver<Vec<ConflictResolutionItem>> {
        self.inner.conflicts_tx.subscribe()
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        self.inner.state.lock().await.queue.to_vec()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Only the latest status is retained; slow subscribers skip states.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.availability.is_available()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    async fn refresh_status(&self) {
        let state = self.inner.state.lock().await;
        self.publish_status(&state);
    }

    fn publish_status(&self, state: &QueueState) {
        let is_online = self.inner.availability.is_available();
        let signed_in = self.inner.auth.current_user_id().is_some();

        let sync_state = if self.inner.shutting_down.load(Ordering::SeqCst) {
            SyncState::Stopped
        } else if self.inner.is_syncing.load(Ordering::SeqCst) {
            SyncState::Syncing
        } else if !signed_in {
            SyncState::Unauthenticated
        } else if !is_online {
            SyncState::Offline
        } else if state.last_error.is_some() {
            SyncState::Error
        } else {
            SyncState::Idle
        };

        self.inner.status_tx.send_replace(SyncStatus {
            state: sync_state,
            is_online,
            pending_count: state.queue.len(),
            conflict_count: state.conflicts.len(),
            last_sync_at: state.last_sync_at,
            last_error: state.last_error.clone(),
        });
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persist_operations(&self, state: &QueueState) {
        if let Err(e) = self.inner.store.save_operations(state.queue.iter()).await {
            error!(error = %e, pending = state.queue.len(), "Failed to persist pending operations");
        }
    }

    async fn persist_conflicts(&self, state: &QueueState) {
        if let Err(e) = self.inner.store.save_conflicts(state.conflicts.iter()).await {
            error!(error = %e, conflicts = state.conflicts.len(), "Failed to persist conflict queue");
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn cache_key(kind: &EntityKind, id: &str) -> String {
    DocumentPath::new(kind.collection(), id).to_string()
}

fn classify(err: &RemoteError) -> OperationOutcome {
    if err.is_retryable() {
        OperationOutcome::Retryable(err.clone())
    } else {
        OperationOutcome::Terminal(err.to_string())
    }
}

/// Builds the remote write for one operation against the document as it
/// will stand once earlier writes land. Returns the write and that
/// document afterwards.
///
/// `updatedAt` is the later of the operation's creation time and the
/// existing stamp, so a device's own queued writes never conflict with
/// each other.
fn build_write(
    op: &SyncOperation,
    current: Option<&FieldMap>,
    user_id: &str,
) -> CoreResult<(BatchWrite, Option<FieldMap>)> {
    let path = op.document_path();
    if op.action == SyncAction::Delete {
        return Ok((BatchWrite::Delete { path }, None));
    }

    let stamp = current
        .and_then(remote_updated_at)
        .map_or(op.created_at, |existing| existing.max(op.created_at));

    let mut fields = op.payload.to_fields()?;
    fields.insert(UPDATED_AT_FIELD.to_string(), Value::String(stamp.to_rfc3339()));
    fields.insert(USER_ID_FIELD.to_string(), Value::String(user_id.to_string()));

    match current {
        Some(existing) => {
            let mut next = existing.clone();
            next.extend(fields.clone());
            Ok((BatchWrite::Update { path, fields }, Some(next)))
        }
        None => {
            if op.action == SyncAction::Create {
                fields.insert(
                    CREATED_AT_FIELD.to_string(),
                    Value::String(op.created_at.to_rfc3339()),
                );
            }
            let next = fields.clone();
            Ok((BatchWrite::Set { path, fields }, Some(next)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use crate::remote::MemoryRemote;
    use chrono::TimeZone;
    use medsync_core::{ManualClock, MedicationFields, MergeRules};
    use serde_json::json;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("medsync_sync=debug")
            .with_test_writer()
            .try_init();
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.sync_on_write = false;
        config
    }

    struct Harness {
        engine: SyncEngine,
        remote: MemoryRemote,
        auth: AuthState,
        clock: ManualClock,
        db: Database,
    }

    async fn harness_with(config: SyncConfig, remote: MemoryRemote) -> Harness {
        init_tracing();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clock = ManualClock::new(t0());
        let auth = AuthState::signed_in("user-1");

        let engine = SyncEngine::builder(config)
            .database(db.clone())
            .remote(remote.clone())
            .auth(auth.clone())
            .clock(clock.clone())
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        Harness {
            engine,
            remote,
            auth,
            clock,
            db,
        }
    }

    async fn harness() -> Harness {
        harness_with(test_config(), MemoryRemote::new()).await
    }

    fn medication(name: &str, strength: f64) -> EntityPayload {
        EntityPayload::Medication(MedicationFields {
            name: Some(name.to_string()),
            strength: Some(strength),
            ..Default::default()
        })
    }

    fn strength(strength: f64) -> EntityPayload {
        EntityPayload::Medication(MedicationFields {
            strength: Some(strength),
            ..Default::default()
        })
    }

    fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn med_path(id: &str) -> DocumentPath {
        DocumentPath::new("medications", id)
    }

    async fn completed(engine: &SyncEngine) -> SyncSummary {
        match engine.trigger_sync().await.unwrap() {
            SyncOutcome::Completed(summary) => summary,
            other => panic!("expected a completed pass, got {other:?}"),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_build_requires_remote_and_auth() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = SyncEngine::builder(test_config())
            .database(db)
            .auth(AuthState::signed_out())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_calls_before_start_are_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::builder(test_config())
            .database(db)
            .remote(MemoryRemote::new())
            .auth(AuthState::signed_in("user-1"))
            .build()
            .await
            .unwrap();

        assert!(matches!(engine.trigger_sync().await, Err(SyncError::NotStarted)));
        assert!(matches!(
            engine.create("med-1", medication("Aspirin", 81.0)).await,
            Err(SyncError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_write_requires_auth() {
        let h = harness().await;
        h.auth.sign_out();

        let err = h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        assert!(h.engine.pending_operations().await.is_empty());
        assert!(h.engine.read(&EntityKind::Medication, "med-1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_operation_is_rejected() {
        let h = harness().await;
        let err = h
            .engine
            .create("med-1", EntityPayload::Medication(MedicationFields::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_local_write_visible_before_sync() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        h.engine.update("med-1", strength(100.0)).await.unwrap();

        let local = h.engine.read(&EntityKind::Medication, "med-1").await.unwrap();
        assert_eq!(local["name"], json!("Aspirin"));
        assert_eq!(local["strength"], json!(100.0));

        assert_eq!(h.engine.pending_operations().await.len(), 2);
        assert!(h.remote.document(&med_path("med-1")).is_none());

        h.engine.delete(&EntityKind::Medication, "med-1").await.unwrap();
        assert!(h.engine.read(&EntityKind::Medication, "med-1").await.is_none());
    }

    #[tokio::test]
    async fn test_pass_commits_in_fifo_batches() {
        let h = harness_with(test_config(), MemoryRemote::new().with_batch_limit(2)).await;
        for id in ["med-1", "med-2", "med-3"] {
            h.engine.create(id, medication("Aspirin", 81.0)).await.unwrap();
        }
        h.clock.advance(chrono::Duration::seconds(1));
        h.engine.update("med-1", strength(100.0)).await.unwrap();

        let summary = completed(&h.engine).await;
        assert_eq!(summary.committed, 4);
        assert_eq!(summary.conflicts, 0);
        assert_eq!(h.remote.batch_sizes(), vec![2, 2]);

        let doc = h.remote.document(&med_path("med-1")).unwrap();
        assert_eq!(doc["strength"], json!(100.0));
        assert_eq!(doc["name"], json!("Aspirin"));
        assert_eq!(doc[USER_ID_FIELD], json!("user-1"));
        assert_eq!(doc[CREATED_AT_FIELD], json!(t0().to_rfc3339()));
        assert!(h.engine.pending_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_detected_on_newer_remote() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "name": "Levothyroxine",
                "strength": 20,
                "updatedAt": (t0() + chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );

        h.engine.update("med-1", strength(10.0)).await.unwrap();
        let summary = completed(&h.engine).await;

        assert_eq!(summary.conflicts, 1);
        assert!(h.engine.pending_operations().await.is_empty());

        let conflicts = h.engine.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        let names: Vec<_> = conflicts[0].conflict_data.conflicting_fields.iter().cloned().collect();
        assert_eq!(names, vec!["strength".to_string()]);
        assert_eq!(h.engine.subscribe_conflicts().borrow().len(), 1);

        // Remote is untouched until the conflict is resolved
        assert_eq!(h.remote.document(&med_path("med-1")).unwrap()["strength"], json!(20));
    }

    #[tokio::test]
    async fn test_no_conflict_on_older_remote() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "strength": 20,
                "updatedAt": (t0() - chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );

        h.engine.update("med-1", strength(10.0)).await.unwrap();
        let summary = completed(&h.engine).await;

        assert_eq!(summary.committed, 1);
        assert!(h.engine.conflicts().await.is_empty());
        assert_eq!(h.remote.document(&med_path("med-1")).unwrap()["strength"], json!(10.0));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_drops_operation() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        h.remote.fail_next((0..3).map(|_| RemoteError::Aborted("contention".into())));

        let first = completed(&h.engine).await;
        assert_eq!(first.retried, 1);
        assert_eq!(h.engine.pending_operations().await[0].retry_count, 1);

        // Backoff not elapsed: nothing is attempted
        let early = completed(&h.engine).await;
        assert_eq!(early.processed, 0);
        assert_eq!(h.engine.pending_operations().await[0].retry_count, 1);

        h.clock.advance(chrono::Duration::seconds(1));
        let second = completed(&h.engine).await;
        assert_eq!(second.retried, 1);
        assert_eq!(h.engine.pending_operations().await[0].retry_count, 2);

        h.clock.advance(chrono::Duration::seconds(2));
        let third = completed(&h.engine).await;
        assert_eq!(third.dropped, 1);
        assert!(h.engine.pending_operations().await.is_empty());

        h.clock.advance(chrono::Duration::minutes(5));
        let after = completed(&h.engine).await;
        assert_eq!(after.processed, 0);
        assert!(h.remote.document(&med_path("med-1")).is_none());
    }

    #[tokio::test]
    async fn test_offline_keeps_queue_until_reconnect() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        h.remote.set_offline(true);

        let summary = completed(&h.engine).await;
        assert_eq!(summary.retried, 1);
        assert!(!h.engine.is_online());
        assert_eq!(h.engine.status().state, SyncState::Offline);
        assert_eq!(h.engine.pending_operations().await.len(), 1);

        assert_eq!(h.engine.trigger_sync().await.unwrap(), SyncOutcome::Offline);

        h.remote.set_offline(false);
        h.clock.advance(chrono::Duration::seconds(1));
        let result = h.engine.force_sync().await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(h.engine.is_online());
        assert!(h.engine.pending_operations().await.is_empty());
        assert!(h.remote.document(&med_path("med-1")).is_some());
    }

    #[tokio::test]
    async fn test_force_sync_reports_unreachable() {
        let h = harness().await;
        h.remote.set_offline(true);
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        completed(&h.engine).await;

        let result = h.engine.force_sync().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "Remote store is unreachable");
        assert_eq!(h.engine.pending_operations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_with_merge() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "strength": 20,
                "notes": "take with food",
                "updatedAt": (t0() + chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );
        h.engine
            .update(
                "med-1",
                EntityPayload::Medication(MedicationFields {
                    strength: Some(10.0),
                    notes: Some("morning".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        completed(&h.engine).await;

        let conflict_id = h.engine.conflicts().await[0].id.clone();
        h.clock.advance(chrono::Duration::minutes(10));
        let rules = MergeRules::new().prefer_remote("notes");
        let resolved = h
            .engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::Merge(rules))
            .await
            .unwrap();

        assert_eq!(resolved["strength"], json!(10.0));
        assert_eq!(resolved["notes"], json!("take with food"));
        assert_eq!(h.remote.document(&med_path("med-1")).unwrap(), resolved);
        assert!(h.engine.conflicts().await.is_empty());
        assert!(h.engine.pending_operations().await.is_empty());

        let local = h.engine.read(&EntityKind::Medication, "med-1").await.unwrap();
        assert_eq!(local["notes"], json!("take with food"));

        let err = h
            .engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::UseRemote)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictNotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_resolution_keeps_conflict() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "strength": 20,
                "updatedAt": (t0() + chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );
        h.engine.update("med-1", strength(10.0)).await.unwrap();
        completed(&h.engine).await;
        let conflict_id = h.engine.conflicts().await[0].id.clone();

        h.remote.fail_next([RemoteError::PermissionDenied("rules".into())]);
        let err = h
            .engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::UseLocal)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Remote(RemoteError::PermissionDenied(_))));
        assert_eq!(h.engine.conflicts().await.len(), 1);
        assert!(h.engine.is_online());

        // The failed attempt does not block a later one
        h.engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::UseLocal)
            .await
            .unwrap();
        assert!(h.engine.conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_resolves_once_under_concurrent_calls() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "strength": 20,
                "updatedAt": (t0() + chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );
        h.engine.update("med-1", strength(10.0)).await.unwrap();
        completed(&h.engine).await;
        let conflict_id = h.engine.conflicts().await[0].id.clone();

        h.remote.set_latency(Some(Duration::from_millis(100)));
        let calls = h.remote.call_count();
        let (a, b) = tokio::join!(
            h.engine
                .resolve_conflict(&conflict_id, ResolutionStrategy::UseLocal),
            h.engine.resolve_conflict(
                &conflict_id,
                ResolutionStrategy::UseCustom(fields(json!({"strength": 99}))),
            ),
        );

        assert!(a.is_ok() ^ b.is_ok());
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, SyncError::ResolutionInProgress { .. }));
        assert_eq!(h.remote.call_count() - calls, 1);
        assert!(h.engine.conflicts().await.is_empty());

        let stored = h.remote.document(&med_path("med-1")).unwrap();
        let local = h.engine.read(&EntityKind::Medication, "med-1").await.unwrap();
        assert_eq!(local["strength"], stored["strength"]);
    }

    #[tokio::test]
    async fn test_cached_records_are_sealed_on_disk() {
        let h = harness().await;
        h.engine.create("med-1", medication("Warfarin", 5.0)).await.unwrap();

        let stored = h.db.cache().get_value("medications/med-1").await.unwrap().unwrap();
        assert!(!stored.value.contains("Warfarin"));

        let local = h.engine.read(&EntityKind::Medication, "med-1").await.unwrap();
        assert_eq!(local["name"], json!("Warfarin"));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-1"),
            fields(json!({
                "strength": 20,
                "updatedAt": (t0() + chrono::Duration::minutes(5)).to_rfc3339(),
            })),
        );
        h.engine.update("med-1", strength(10.0)).await.unwrap();
        completed(&h.engine).await;
        h.engine.create("med-2", medication("Metformin", 500.0)).await.unwrap();
        h.engine.shutdown().await;
        assert_eq!(h.engine.status().state, SyncState::Stopped);

        let restarted = SyncEngine::builder(test_config())
            .database(h.db.clone())
            .remote(h.remote.clone())
            .auth(AuthState::signed_out())
            .clock(h.clock.clone())
            .build()
            .await
            .unwrap();
        restarted.start().await.unwrap();

        let pending = restarted.pending_operations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "med-2");
        assert_eq!(restarted.conflicts().await.len(), 1);
        assert_eq!(restarted.status().last_sync_at, Some(t0()));

        let local = restarted.read(&EntityKind::Medication, "med-2").await.unwrap();
        assert_eq!(local["name"], json!("Metformin"));
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_triggers_background_sync() {
        let mut config = test_config();
        config.sync.sync_on_write = true;
        let h = harness_with(config, MemoryRemote::new()).await;

        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();

        let remote = h.remote.clone();
        wait_for(|| remote.document(&med_path("med-1")).is_some()).await;
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sign_in_resumes_sync() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();

        h.auth.sign_out();
        let engine = h.engine.clone();
        wait_for(|| engine.status().state == SyncState::Unauthenticated).await;
        assert_eq!(h.engine.trigger_sync().await.unwrap(), SyncOutcome::NotAuthenticated);
        assert!(h.remote.document(&med_path("med-1")).is_none());

        h.auth.sign_in("user-1");
        let remote = h.remote.clone();
        wait_for(|| remote.document(&med_path("med-1")).is_some()).await;
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_tracks_queue() {
        let h = harness().await;
        let status = h.engine.subscribe_status();
        assert_eq!(status.borrow().state, SyncState::Idle);
        assert!(status.borrow().is_online);

        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        assert_eq!(status.borrow().pending_count, 1);

        completed(&h.engine).await;
        let current = status.borrow().clone();
        assert_eq!(current.pending_count, 0);
        assert_eq!(current.state, SyncState::Idle);
        assert_eq!(current.last_sync_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_queue_bound_evicts_oldest() {
        let mut config = test_config();
        config.queue.max_queue_size = 3;
        let h = harness_with(config, MemoryRemote::new()).await;

        for i in 0..4 {
            h.engine
                .create(format!("med-{i}"), medication("Aspirin", 81.0))
                .await
                .unwrap();
        }

        let ids: Vec<_> = h
            .engine
            .pending_operations()
            .await
            .into_iter()
            .map(|op| op.entity_id)
            .collect();
        assert_eq!(ids, vec!["med-1", "med-2", "med-3"]);
    }

    #[tokio::test]
    async fn test_terminal_failure_drops_operation() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        h.remote.fail_next([RemoteError::PermissionDenied("rules".into())]);

        let summary = completed(&h.engine).await;
        assert_eq!(summary.dropped, 1);
        assert!(h.engine.pending_operations().await.is_empty());

        let status = h.engine.status();
        assert_eq!(status.state, SyncState::Error);
        assert!(status.last_error.unwrap().contains("rules"));
        assert!(h.engine.is_online());
    }

    #[tokio::test]
    async fn test_refresh_collection_keeps_pending_and_scopes_user() {
        let h = harness().await;
        h.remote.insert_document(
            &med_path("med-a"),
            fields(json!({"name": "Aspirin", "userId": "user-1"})),
        );
        h.remote.insert_document(
            &med_path("med-b"),
            fields(json!({"name": "Remote name", "userId": "user-1"})),
        );
        h.remote.insert_document(
            &med_path("med-c"),
            fields(json!({"name": "Someone else", "userId": "user-2"})),
        );
        h.engine.create("med-b", medication("Local name", 5.0)).await.unwrap();

        let stored = h
            .engine
            .refresh_collection(&EntityKind::Medication, Vec::new())
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let a = h.engine.read(&EntityKind::Medication, "med-a").await.unwrap();
        assert_eq!(a["name"], json!("Aspirin"));
        let b = h.engine.read(&EntityKind::Medication, "med-b").await.unwrap();
        assert_eq!(b["name"], json!("Local name"));
        assert!(h.engine.read(&EntityKind::Medication, "med-c").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_pass_reports_already_syncing() {
        let h = harness().await;
        h.engine.create("med-1", medication("Aspirin", 81.0)).await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(200)));

        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.trigger_sync().await });

        let engine = h.engine.clone();
        wait_for(|| engine.is_syncing()).await;

        let forced = h.engine.force_sync().await.unwrap();
        assert!(!forced.success);
        assert_eq!(forced.message, "Sync already in progress");
        assert_eq!(h.engine.trigger_sync().await.unwrap(), SyncOutcome::AlreadySyncing);

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(summary) if summary.committed == 1));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_calls() {
        let h = harness().await;
        h.engine.shutdown().await;
        h.engine.shutdown().await;

        assert!(matches!(h.engine.trigger_sync().await, Err(SyncError::ShuttingDown)));
        assert!(matches!(h.engine.start().await, Err(SyncError::ShuttingDown)));
    }
}
