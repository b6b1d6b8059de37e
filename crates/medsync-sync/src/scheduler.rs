//! # Scheduled Tasks
//!
//! Cancellable periodic background work owned by the engine: the sync
//! timer, cache cleanup and availability re-probing.
//!
//! ```text
//!   spawn(period) ──► [tick] ──► Continue ──► wait period ──► [tick] ...
//!                        │
//!                        ├──► Stop            (task exits by itself)
//!                        │
//!   stop().await ────────┴──► shutdown signal, then join the task
//! ```
//!
//! A running tick is never interrupted: `stop()` waits for it to return.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// What a tick wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// When the first tick runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediately,
    AfterPeriod,
}

/// Handle to a periodic background task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns `tick` every `period` until it returns [`TaskControl::Stop`]
    /// or the task is stopped.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, first: FirstTick, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let start = match first {
                FirstTick::Immediately => Instant::now(),
                FirstTick::AfterPeriod => Instant::now() + period,
            };
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(task = name, period_ms = period.as_millis() as u64, "Scheduled task started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if tick().await == TaskControl::Stop {
                            debug!(task = name, "Scheduled task finished");
                            break;
                        }
                    }

                    _ = shutdown_rx.changed() => {
                        debug!(task = name, "Scheduled task cancelled");
                        break;
                    }
                }
            }
        });

        ScheduledTask {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once the task has exited, by itself or by `stop`.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the task and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(task = self.name, "Scheduled task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = ScheduledTask::spawn(
            "counter",
            Duration::from_secs(60),
            FirstTick::Immediately,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    TaskControl::Continue
                }
            },
        );

        // Immediate tick plus two periods
        tokio::time::sleep(Duration::from_secs(121)).await;
        task.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert_eq!(after_stop, 3);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = ScheduledTask::spawn(
            "delayed",
            Duration::from_secs(60),
            FirstTick::AfterPeriod,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    TaskControl::Continue
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_stop_task() {
        let task = ScheduledTask::spawn(
            "one-shot",
            Duration::from_secs(1),
            FirstTick::Immediately,
            || async { TaskControl::Stop },
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(task.is_finished());
        task.stop().await;
    }
}
