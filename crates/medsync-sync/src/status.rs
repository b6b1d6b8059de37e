//! # Sync Status and Outcomes
//!
//! Values the engine reports to the application: the live [`SyncStatus`]
//! published on a `watch` channel, and the explicit results of sync calls.
//!
//! ```text
//!   trigger_sync() ──► SyncOutcome
//!                        ├── Completed(SyncSummary)
//!                        ├── AlreadySyncing
//!                        ├── Offline
//!                        └── NotAuthenticated
//!
//!   force_sync()   ──► ForceSyncResult { success, operations_processed, .. }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use medsync_core::ConflictData;

use crate::remote::RemoteError;

/// Coarse engine state for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Offline,
    Unauthenticated,
    /// The last pass hit a failure other than lost connectivity.
    Error,
    Stopped,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Offline => write!(f, "offline"),
            SyncState::Unauthenticated => write!(f, "unauthenticated"),
            SyncState::Error => write!(f, "error"),
            SyncState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_online: bool,
    pub pending_count: usize,
    pub conflict_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What happened to one operation during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Written to the remote store; removed from the queue.
    Committed,
    /// Moved to the conflict queue.
    Conflicted(Box<ConflictData>),
    /// Stays queued with backoff, or is dropped once retries run out.
    Retryable(RemoteError),
    /// Dropped without retry.
    Terminal(String),
    /// Not attempted this pass because an earlier operation on the same
    /// document did not go through.
    Deferred,
}

/// Counts for one completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Operations that reached a decision (everything but deferred).
    pub processed: usize,
    pub committed: usize,
    pub conflicts: usize,
    /// Operations left queued for a later attempt.
    pub retried: usize,
    /// Operations dropped, terminally or after their last retry.
    pub dropped: usize,
    pub deferred: usize,
}

impl SyncSummary {
    pub(crate) fn record(&mut self, outcome: &OperationOutcome) {
        match outcome {
            OperationOutcome::Committed => self.committed += 1,
            OperationOutcome::Conflicted(_) => self.conflicts += 1,
            OperationOutcome::Retryable(_) => {}
            OperationOutcome::Terminal(_) => self.dropped += 1,
            OperationOutcome::Deferred => self.deferred += 1,
        }
        if !matches!(outcome, OperationOutcome::Deferred) {
            self.processed += 1;
        }
    }

    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.dropped == 0
    }
}

/// Result of [`SyncEngine::trigger_sync`](crate::SyncEngine::trigger_sync).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    AlreadySyncing,
    Offline,
    NotAuthenticated,
}

/// Result of [`SyncEngine::force_sync`](crate::SyncEngine::force_sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSyncResult {
    pub success: bool,
    pub operations_processed: usize,
    pub conflicts_detected: usize,
    pub message: String,
}

impl ForceSyncResult {
    pub(crate) fn not_run(message: impl Into<String>) -> Self {
        ForceSyncResult {
            success: false,
            operations_processed: 0,
            conflicts_detected: 0,
            message: message.into(),
        }
    }

    pub(crate) fn from_summary(summary: &SyncSummary) -> Self {
        let message = if summary.is_clean() {
            format!(
                "Synced {} operation(s), {} conflict(s)",
                summary.processed, summary.conflicts
            )
        } else {
            format!(
                "Synced {} operation(s), {} conflict(s), {} retrying, {} dropped",
                summary.processed, summary.conflicts, summary.retried, summary.dropped
            )
        };

        ForceSyncResult {
            success: summary.is_clean(),
            operations_processed: summary.processed,
            conflicts_detected: summary.conflicts,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = SyncSummary::default();
        summary.record(&OperationOutcome::Committed);
        summary.record(&OperationOutcome::Deferred);
        summary.record(&OperationOutcome::Terminal("denied".into()));

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.dropped, 1);
        assert!(!summary.is_clean());

        let result = ForceSyncResult::from_summary(&summary);
        assert!(!result.success);
        assert!(result.message.contains("1 dropped"));
    }
}
