//! Async Task Runner - Bounded Background Pool
//!
//! Fire-and-forget execution of background work such as cache warm-up or bulk
//! refresh. `submit` never waits for the task: it either enqueues it or applies
//! the configured rejection policy when the queue is full.
//!
//! Under `CallerRuns` a full queue spills into a second bounded lane: at most
//! `overflow_limit` tasks run outside the queue at once, and `shutdown` waits
//! for them as well as for the queue.
//!
//! Every task runs inside a wrapper that catches both errors and panics and
//! logs them with the task's name, so one bad task never takes a worker down
//! and never reaches the submitter.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures_util::FutureExt;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{RejectionPolicy, TaskRunnerConfig};

type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A submitted unit of work with the context needed to log its failure
struct TaskWrapper {
    id: u64,
    name: String,
    submitted_at: Instant,
    task: BoxedTask,
}

impl TaskWrapper {
    /// Run to completion; never panics, never returns an error
    async fn run(self, stats: &AtomicRunnerStats) {
        let queued_ms = self.submitted_at.elapsed().as_millis();
        match AssertUnwindSafe(self.task).catch_unwind().await {
            Ok(Ok(())) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = self.id, task = %self.name, queued_ms, "Task completed");
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(task_id = self.id, task = %self.name, error = ?e, "Task failed");
            }
            Err(panic) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    task_id = self.id,
                    task = %self.name,
                    panic = panic_message(panic.as_ref()),
                    "Task panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Task runner statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskRunnerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct AtomicRunnerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

impl AtomicRunnerStats {
    fn snapshot(&self) -> TaskRunnerStats {
        TaskRunnerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Bounded worker pool for background work
///
/// Must be created inside a Tokio runtime.
pub struct AsyncTaskRunner {
    sender: parking_lot::Mutex<Option<mpsc::Sender<TaskWrapper>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Overflow tasks still tracked; `None` once shut down
    overflow: parking_lot::Mutex<Option<Vec<JoinHandle<()>>>>,
    overflow_permits: Arc<Semaphore>,
    stats: Arc<AtomicRunnerStats>,
    policy: RejectionPolicy,
    next_id: AtomicU64,
}

impl AsyncTaskRunner {
    /// Spawn `config.workers` workers sharing one bounded queue
    #[must_use]
    pub fn new(config: TaskRunnerConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<TaskWrapper>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(AtomicRunnerStats::default());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver only while waiting, not while running
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            debug!(worker, "Task queue closed, worker exiting");
                            break;
                        };
                        task.run(&stats).await;
                    }
                })
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            policy = ?config.rejection_policy,
            overflow_limit = config.overflow_limit,
            "Async task runner started"
        );

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            workers: parking_lot::Mutex::new(workers),
            overflow: parking_lot::Mutex::new(Some(Vec::new())),
            overflow_permits: Arc::new(Semaphore::new(config.overflow_limit)),
            stats,
            policy: config.rejection_policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Submit a task without waiting for it
    ///
    /// # Arguments
    ///
    /// * `name` - Label used when the task's failure is logged
    /// * `task` - The work; errors and panics are caught and logged
    ///
    /// # Returns
    ///
    /// `true` if the task was accepted (queued, or placed in the overflow lane
    /// under `CallerRuns`), `false` if it was rejected or the runner is shut
    /// down.
    pub fn submit<F>(&self, name: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapper = TaskWrapper {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            submitted_at: Instant::now(),
            task: Box::pin(task),
        };

        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return self.reject(&wrapper, "Task runner is shut down, task rejected");
        };

        match sender.try_send(wrapper) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(wrapper)) => match self.policy {
                RejectionPolicy::Reject => self.reject(&wrapper, "Task queue full, task rejected"),
                RejectionPolicy::CallerRuns => self.run_overflow(wrapper),
            },
            Err(mpsc::error::TrySendError::Closed(wrapper)) => {
                self.reject(&wrapper, "Task queue closed, task rejected")
            }
        }
    }

    fn reject(&self, wrapper: &TaskWrapper, reason: &'static str) -> bool {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(task = %wrapper.name, "{reason}");
        false
    }

    /// Run a task outside the queue if an overflow permit is free
    fn run_overflow(&self, wrapper: TaskWrapper) -> bool {
        let Ok(permit) = Arc::clone(&self.overflow_permits).try_acquire_owned() else {
            return self.reject(&wrapper, "Task queue and overflow lane full, task rejected");
        };

        let mut overflow = self.overflow.lock();
        let Some(handles) = overflow.as_mut() else {
            return self.reject(&wrapper, "Task runner is shut down, task rejected");
        };
        handles.retain(|handle| !handle.is_finished());

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task = %wrapper.name, "Task queue full, running in overflow lane");
        let stats = Arc::clone(&self.stats);
        handles.push(tokio::spawn(async move {
            wrapper.run(&stats).await;
            drop(permit);
        }));
        true
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats(&self) -> TaskRunnerStats {
        self.stats.snapshot()
    }

    /// Stop accepting tasks and wait for queued and overflow ones to finish
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let overflow = self.overflow.lock().take().unwrap_or_default();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers.into_iter().chain(overflow) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task runner task ended abnormally");
            }
        }
        info!(stats = ?self.stats.snapshot(), "Async task runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn runner(workers: usize, queue_capacity: usize, policy: RejectionPolicy) -> AsyncTaskRunner {
        AsyncTaskRunner::new(TaskRunnerConfig {
            workers,
            queue_capacity,
            rejection_policy: policy,
            overflow_limit: 1,
        })
    }

    /// Task that sleeps while recording how many tasks run at once
    fn tracked(
        running: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        let running = Arc::clone(running);
        let peak = Arc::clone(peak);
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_pool() {
        let runner = runner(1, 8, RejectionPolicy::Reject);
        let ran = Arc::new(AtomicUsize::new(0));

        assert!(runner.submit("fails", async { anyhow::bail!("boom") }));
        assert!(runner.submit("panics", async { panic!("kaboom") }));
        let counter = Arc::clone(&ran);
        assert!(runner.submit("succeeds", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        runner.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = runner.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let runner = runner(1, 1, RejectionPolicy::Reject);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the only worker, then fill the single queue slot
        assert!(runner.submit("blocker", async move {
            let _ = release_rx.await;
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.submit("queued", async { Ok(()) }));

        assert!(!runner.submit("overflow", async { Ok(()) }));
        assert_eq!(runner.stats().rejected, 1);

        let _ = release_tx.send(());
        runner.shutdown().await;
        assert_eq!(runner.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_caller_runs_when_saturated() {
        let runner = runner(1, 1, RejectionPolicy::CallerRuns);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let overflow_ran = Arc::new(AtomicUsize::new(0));

        assert!(runner.submit("blocker", async move {
            let _ = release_rx.await;
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.submit("queued", async { Ok(()) }));

        let counter = Arc::clone(&overflow_ran);
        assert!(runner.submit("overflow", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(overflow_ran.load(Ordering::SeqCst), 1);
        assert_eq!(runner.stats().rejected, 0);

        let _ = release_tx.send(());
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_caller_runs_is_bounded_and_drained_on_shutdown() {
        let runner = AsyncTaskRunner::new(TaskRunnerConfig {
            workers: 1,
            queue_capacity: 1,
            rejection_policy: RejectionPolicy::CallerRuns,
            overflow_limit: 2,
        });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let accepted = (0..50)
            .filter(|i| runner.submit(format!("burst-{i}"), tracked(&running, &peak)))
            .count();
        let stats = runner.stats();
        assert!(accepted <= 1 + 1 + 2, "accepted {accepted}");
        assert_eq!(stats.rejected, 50 - accepted as u64);

        runner.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 1 + 2);
        assert_eq!(running.load(Ordering::SeqCst), 0, "shutdown waits for overflow tasks");
        assert_eq!(runner.stats().completed, accepted as u64);
    }

    #[tokio::test]
    async fn test_overflow_permit_is_returned() {
        let runner = runner(1, 1, RejectionPolicy::CallerRuns);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for round in 0..3 {
            // Worker busy, queue slot taken, one overflow slot
            let accepted = (0..4)
                .filter(|i| runner.submit(format!("r{round}-{i}"), tracked(&running, &peak)))
                .count();
            assert!(accepted >= 2, "round {round} accepted {accepted}");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        runner.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let runner = runner(2, 4, RejectionPolicy::Reject);
        runner.shutdown().await;
        assert!(!runner.submit("late", async { Ok(()) }));
    }
}
