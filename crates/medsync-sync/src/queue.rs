//! # Operation Queue
//!
//! Bounded FIFO of pending [`SyncOperation`]s.
//!
//! ## Queue Bound
//! ```text
//!   max_size = 3
//!
//!   [op1, op2, op3] + enqueue(op4)
//!     │
//!     └── op1 evicted (oldest, logged)
//!
//!   [op2, op3, op4]
//! ```
//!
//! ## Retry Schedule
//! A retryable failure pushes `next_attempt_at` out by `retry_delay`
//! doubled per attempt: 1s, 2s, 4s, ... capped at [`MAX_RETRY_DELAY`].
//! An operation is never attempted again once `retry_count` reaches
//! `max_retries`.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use medsync_core::{DocumentPath, SyncOperation};

/// Upper bound on a single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);

/// Delay before attempt `attempt + 1`, where `attempt` is the number of
/// failures so far (1 for the first failure).
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let mut schedule = ExponentialBackoff {
        current_interval: base,
        initial_interval: base,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_RETRY_DELAY.max(base),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut delay = base;
    for _ in 0..attempt.max(1) {
        delay = schedule.next_backoff().unwrap_or(MAX_RETRY_DELAY);
    }
    delay
}

/// Bounded FIFO of pending operations.
#[derive(Debug, Clone)]
pub struct OperationQueue {
    ops: VecDeque<SyncOperation>,
    max_size: usize,
}

impl OperationQueue {
    pub fn new(max_size: usize) -> Self {
        OperationQueue {
            ops: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Rebuilds a queue from a persisted snapshot, keeping the newest
    /// `max_size` operations.
    pub fn from_snapshot(ops: Vec<SyncOperation>, max_size: usize) -> Self {
        let mut queue = Self::new(max_size);
        for op in ops {
            queue.enqueue(op);
        }
        queue
    }

    /// Appends an operation. Returns the evicted oldest operation when the
    /// queue was full.
    pub fn enqueue(&mut self, op: SyncOperation) -> Option<SyncOperation> {
        let evicted = if self.ops.len() >= self.max_size {
            self.ops.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            warn!(
                op_id = %old.id,
                entity_kind = %old.entity_kind,
                entity_id = %old.entity_id,
                max_size = self.max_size,
                "Queue full, evicted oldest pending operation"
            );
        }

        debug!(op_id = %op.id, action = %op.action, entity_kind = %op.entity_kind, "Operation queued");
        self.ops.push_back(op);
        evicted
    }

    /// Operations whose backoff has elapsed, in FIFO order.
    ///
    /// An operation waiting out its backoff holds back every later
    /// operation on the same document.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<SyncOperation> {
        let mut waiting: HashSet<DocumentPath> = HashSet::new();
        let mut due = Vec::new();

        for op in &self.ops {
            let path = op.document_path();
            if waiting.contains(&path) {
                continue;
            }
            if op.is_due(now) {
                due.push(op.clone());
            } else {
                waiting.insert(path);
            }
        }
        due
    }

    pub fn remove(&mut self, id: &str) -> Option<SyncOperation> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        self.ops.remove(index)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SyncOperation> {
        self.ops.iter_mut().find(|op| op.id == id)
    }

    /// True if any queued operation targets this document.
    pub fn touches(&self, collection: &str, document_id: &str) -> bool {
        self.ops.iter().any(|op| {
            op.entity_id == document_id && op.entity_kind.collection() == collection
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter()
    }

    pub fn to_vec(&self) -> Vec<SyncOperation> {
        self.ops.iter().cloned().collect()
    }
}
