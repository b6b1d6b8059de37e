//! # Remote Availability Tracker
//!
//! Remembers whether the remote store was last seen reachable, and keeps
//! probing it while it is not.
//!
//! ```text
//!              probe ok / set_available(true)
//!        ┌──────────────────────────────────────────┐
//!        │                                          │
//!   ┌────▼──────┐   probe fails / connectivity   ┌──┴──────────┐
//!   │ Available │ ─────────── error ───────────► │ Unavailable │
//!   └───────────┘                                 └──────┬──────┘
//!                                                        │ every reprobe_interval
//!                                                        ▼
//!                                                   probe(timeout)
//! ```
//!
//! The flag survives restarts through the `remote_available` key. Changes
//! are published on a `watch` channel; the engine starts a pass when the
//! flag flips back to available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use medsync_db::KvRepository;

use crate::remote::{with_timeout, RemoteAdapter};
use crate::scheduler::{FirstTick, ScheduledTask, TaskControl};

/// Persisted key holding the last known availability.
pub const REMOTE_AVAILABLE_KEY: &str = "remote_available";

struct TrackerInner {
    remote: Arc<dyn RemoteAdapter>,
    kv: KvRepository,
    tx: watch::Sender<bool>,
    probe_timeout: Duration,
    reprobe_interval: Duration,
    reprobe: Mutex<Option<ScheduledTask>>,
    stopped: AtomicBool,
}

/// Shared handle; clones observe the same flag.
#[derive(Clone)]
pub struct AvailabilityTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for AvailabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityTracker")
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl AvailabilityTracker {
    pub fn new(
        remote: Arc<dyn RemoteAdapter>,
        kv: KvRepository,
        probe_timeout: Duration,
        reprobe_interval: Duration,
    ) -> Self {
        let (tx, _) = watch::channel(true);
        AvailabilityTracker {
            inner: Arc::new(TrackerInner {
                remote,
                kv,
                tx,
                probe_timeout,
                reprobe_interval,
                reprobe: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Restores the persisted flag. Unknown or missing means available.
    pub async fn load(&self) {
        let available = match self.inner.kv.get(REMOTE_AVAILABLE_KEY).await {
            Ok(Some(raw)) => raw.trim() != "false",
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Could not read persisted availability");
                true
            }
        };
        self.inner.tx.send_replace(available);
        if !available {
            self.ensure_reprobe();
        }
    }

    pub fn is_available(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Pings the remote once under `timeout` and records the result.
    pub async fn probe(&self, timeout: Duration) -> bool {
        match with_timeout(timeout, self.inner.remote.ping()).await {
            Ok(()) => {
                self.set_available(true).await;
                true
            }
            Err(e) => {
                debug!(error = %e, "Availability probe failed");
                self.set_available(false).await;
                false
            }
        }
    }

    /// Records availability, persists it, and starts re-probing when the
    /// remote is unavailable.
    pub async fn set_available(&self, available: bool) {
        let changed = self.inner.tx.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });

        if changed {
            if available {
                info!("Remote store is reachable");
            } else {
                warn!("Remote store is unreachable, scheduling re-probe");
            }
        }

        let raw = if available { "true" } else { "false" };
        if let Err(e) = self.inner.kv.put(REMOTE_AVAILABLE_KEY, raw).await {
            warn!(error = %e, "Could not persist availability");
        }

        if !available {
            self.ensure_reprobe();
        }
    }

    /// True while a re-probe task is scheduled.
    pub fn is_reprobing(&self) -> bool {
        self.lock_reprobe()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn lock_reprobe(&self) -> std::sync::MutexGuard<'_, Option<ScheduledTask>> {
        self.inner.reprobe.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_reprobe(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut slot = self.lock_reprobe();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        *slot = Some(ScheduledTask::spawn(
            "availability-reprobe",
            self.inner.reprobe_interval,
            FirstTick::AfterPeriod,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return TaskControl::Stop;
                    };
                    let tracker = AvailabilityTracker { inner };
                    if tracker.is_available() {
                        return TaskControl::Stop;
                    }
                    let timeout = tracker.inner.probe_timeout;
                    if tracker.probe(timeout).await {
                        TaskControl::Stop
                    } else {
                        TaskControl::Continue
                    }
                }
            },
        ));
    }

    /// Stops re-probing for good.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let task = self.lock_reprobe().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteError};
    use medsync_db::{Database, DbConfig};

    async fn setup(reprobe: Duration) -> (AvailabilityTracker, MemoryRemote, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = MemoryRemote::new();
        let tracker = AvailabilityTracker::new(
            Arc::new(remote.clone()),
            db.kv(),
            Duration::from_secs(5),
            reprobe,
        );
        tracker.load().await;
        (tracker, remote, db)
    }

    #[tokio::test]
    async fn test_defaults_to_available() {
        let (tracker, _remote, _db) = setup(Duration::from_secs(300)).await;
        assert!(tracker.is_available());
        assert!(!tracker.is_reprobing());
    }

    #[tokio::test]
    async fn test_probe_failure_persists_and_reprobes() {
        let (tracker, remote, db) = setup(Duration::from_secs(300)).await;
        remote.set_offline(true);

        assert!(!tracker.probe(Duration::from_secs(1)).await);
        assert!(!tracker.is_available());
        assert!(tracker.is_reprobing());
        assert_eq!(
            db.kv().get(REMOTE_AVAILABLE_KEY).await.unwrap().as_deref(),
            Some("false")
        );

        tracker.shutdown().await;
        assert!(!tracker.is_reprobing());
    }

    #[tokio::test]
    async fn test_persisted_flag_survives_restart() {
        let (tracker, remote, db) = setup(Duration::from_secs(300)).await;
        remote.fail_next([RemoteError::Unavailable("dns".into())]);
        tracker.probe(Duration::from_secs(1)).await;
        tracker.shutdown().await;

        let reopened = AvailabilityTracker::new(
            Arc::new(remote.clone()),
            db.kv(),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        reopened.load().await;
        assert!(!reopened.is_available());
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_reprobe_recovers_and_notifies() {
        let (tracker, remote, _db) = setup(Duration::from_millis(20)).await;
        let mut rx = tracker.subscribe();

        remote.set_offline(true);
        tracker.set_available(false).await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        remote.set_offline(false);
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("reprobe should flip the flag")
            .unwrap();
        assert!(*rx.borrow_and_update());

        // The task stops itself once the remote answers
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tracker.is_reprobing());
    }
}
