//! Queue engine
//!
//! Claims tasks with a two-phase select + conditional update, dispatches them
//! to registered handlers, and writes the outcome back. Retries, heartbeats
//! and stuck-task recovery are all expressed as conditional updates, so any
//! number of engines can share one store.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::QueueConfig;
use super::loops;
use super::registry::{HandlerRegistry, HandlerResult, Resolved};
use crate::persistence::{LeaseGuard, NewTask, StoreError, Task, TaskStatus, TaskStore};

/// Default ceiling on attempts for new tasks
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Selection retries after losing a claim race, per claim cycle
const MAX_CLAIM_RACES: usize = 10;

/// Queue engine errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Options for [`TaskQueue::add`]
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Higher is claimed first
    pub priority: i32,

    /// Earliest eligible time (defaults to now)
    pub run_at: Option<DateTime<Utc>>,

    /// Attempt ceiling (defaults to [`DEFAULT_MAX_ATTEMPTS`])
    pub max_attempts: Option<u32>,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Run no earlier than `delay` from now
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.run_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Set the attempt ceiling (at least 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

/// What happened to a dispatched task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler succeeded and the result was recorded
    Completed,

    /// Handler failed; the task is pending again after `delay`
    Retrying { attempt: u32, delay: Duration },

    /// Terminal failure (retries exhausted or no handler)
    Failed,

    /// This instance no longer owns the row; nothing was written
    Abandoned,

    /// No handler here serves the row's `task_key`; it is pending again
    /// with the claim undone
    Released,
}

/// Result of one stuck-task scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Stuck tasks returned to pending
    pub requeued: u64,

    /// Stuck tasks that had exhausted their attempts
    pub failed: u64,
}

impl RecoveryReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Point-in-time queue statistics (not transactionally consistent)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub worker_id: String,
    /// Tasks currently dispatched by this instance
    pub in_flight: usize,
}

/// Background loops owned by a started engine
struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub(super) struct QueueInner {
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) config: QueueConfig,
    pub(super) registry: HandlerRegistry,
    pub(super) slots: Arc<Semaphore>,
    /// Tasks dispatched by the poll loop and not yet finished
    pub(super) in_flight: Arc<AtomicUsize>,
    running: Mutex<Option<RunningState>>,
}

/// Task queue engine
///
/// Cheap to clone; clones share handlers, lifecycle and in-flight slots.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use rowq::{AddOptions, InMemoryTaskStore, QueueConfig, TaskQueue};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), rowq::QueueError> {
/// let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()), QueueConfig::default())?;
///
/// queue.register("send_email", |task| async move {
///     Ok(json!({ "sent_to": task.payload["to"] }))
/// });
///
/// queue
///     .add("send_email", json!({ "to": "a@example.com" }), AddOptions::new().with_priority(5))
///     .await?;
///
/// queue.start().await?;
/// // ... later
/// queue.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    pub(super) inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a new engine over `store`
    pub fn new(store: Arc<dyn TaskStore>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                slots: Arc::new(Semaphore::new(config.concurrency)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                config,
                registry: HandlerRegistry::new(),
                running: Mutex::new(None),
            }),
        })
    }

    /// Register a handler for `name`, replacing any previous one
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        debug!(task_name = %name, "registered handler");
        self.inner.registry.register(name, handler);
    }

    /// Register a handler for rows named `name` whose payload `task_key` is `key`
    ///
    /// Handlers for other keys under the same name stay registered, and rows
    /// with a key nobody registered here are never claimed by this instance.
    pub fn register_keyed<F, Fut>(&self, name: impl Into<String>, key: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        let key = key.into();
        debug!(task_name = %name, task_key = %key, "registered keyed handler");
        self.inner.registry.register_keyed(name, key, handler);
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    /// Tasks currently dispatched by the poll loop
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Enqueue a new pending task
    #[instrument(skip(self, payload, options), fields(worker_id = %self.worker_id()))]
    pub async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: AddOptions,
    ) -> Result<Task, QueueError> {
        let task = self
            .inner
            .store
            .insert(NewTask {
                name: name.to_string(),
                payload,
                priority: options.priority,
                run_at: options.run_at.unwrap_or_else(Utc::now),
                max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            })
            .await?;

        debug!(
            task_id = %task.id,
            task_name = %task.name,
            priority = task.priority,
            run_at = %task.run_at,
            "added task"
        );
        Ok(task)
    }

    /// Run one claim cycle: select the next eligible task and lease it
    ///
    /// Returns `None` when nothing is eligible. A lost race re-runs the
    /// selection.
    pub async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        let filter = self
            .inner
            .registry
            .claim_filter(self.inner.config.claim_scope);
        if filter.is_empty() {
            return Ok(None);
        }

        for _ in 0..MAX_CLAIM_RACES {
            let now = Utc::now();
            let Some(candidate) = self
                .inner
                .store
                .find_next_pending(&filter, now)
                .await?
            else {
                return Ok(None);
            };

            if let Some(task) = self
                .inner
                .store
                .claim(candidate.id, self.worker_id(), now)
                .await?
            {
                debug!(
                    task_id = %task.id,
                    task_name = %task.name,
                    attempt = task.attempts,
                    "claimed task"
                );
                return Ok(Some(task));
            }

            debug!(task_id = %candidate.id, "lost claim race, reselecting");
        }

        Ok(None)
    }

    /// Execute a claimed task and record its outcome
    #[instrument(
        skip(self, task),
        fields(task_id = %task.id, task_name = %task.name, attempt = task.attempts)
    )]
    pub async fn process_task(&self, task: Task) -> Result<TaskOutcome, QueueError> {
        let handler = match self.inner.registry.resolve(&task) {
            Resolved::Handler(handler) => handler,
            Resolved::Missing => {
                let message = format!("no handler registered for task: {}", task.name);
                warn!(task_id = %task.id, "{}", message);

                let guard = LeaseGuard::Owner(self.worker_id().to_string());
                let failed = self
                    .inner
                    .store
                    .fail(task.id, &guard, &message, Utc::now())
                    .await?;
                return Ok(if failed {
                    TaskOutcome::Failed
                } else {
                    TaskOutcome::Abandoned
                });
            }
            Resolved::UnknownKey => {
                // Leave the row for the instance that serves its key
                let released = self
                    .inner
                    .store
                    .release(task.id, self.worker_id(), Utc::now())
                    .await?;
                if !released {
                    return Ok(TaskOutcome::Abandoned);
                }
                debug!(task_id = %task.id, task_key = ?task.task_key(), "released task for another key");
                return Ok(TaskOutcome::Released);
            }
        };

        let task_id = task.id;
        let invocation = AssertUnwindSafe(async move { handler(task).await })
            .catch_unwind()
            .await;

        let message = match invocation {
            Ok(Ok(result)) => {
                let completed = self
                    .inner
                    .store
                    .complete(task_id, self.worker_id(), result, Utc::now())
                    .await?;
                if completed {
                    debug!(%task_id, "task completed");
                    return Ok(TaskOutcome::Completed);
                }
                warn!(%task_id, "lease lost before completion was recorded");
                return Ok(TaskOutcome::Abandoned);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        self.handle_failure(task_id, &message).await
    }

    /// Retry-or-fail after a handler error, only while this instance owns the row
    async fn handle_failure(&self, task_id: Uuid, message: &str) -> Result<TaskOutcome, QueueError> {
        let current = self.inner.store.get(task_id).await?;
        let owned = current.filter(|t| {
            t.status == TaskStatus::Processing && t.worker_id.as_deref() == Some(self.worker_id())
        });
        let Some(current) = owned else {
            warn!(%task_id, "task no longer owned by this worker, abandoning");
            return Ok(TaskOutcome::Abandoned);
        };

        let guard = LeaseGuard::Owner(self.worker_id().to_string());
        self.retry_or_fail(&current, &guard, message).await
    }

    /// Shared retry decision for handler failures and stuck recovery
    async fn retry_or_fail(
        &self,
        task: &Task,
        guard: &LeaseGuard,
        message: &str,
    ) -> Result<TaskOutcome, QueueError> {
        let now = Utc::now();
        let error_text = format!("attempt {}/{}: {}", task.attempts, task.max_attempts, message);

        if task.has_attempts_remaining() {
            let delay = self.inner.config.backoff.delay_after_attempt(task.attempts);
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

            let requeued = self
                .inner
                .store
                .requeue(task.id, guard, run_at, &error_text, now)
                .await?;
            if !requeued {
                return Ok(TaskOutcome::Abandoned);
            }

            info!(
                task_id = %task.id,
                task_name = %task.name,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "task failed, retrying: {}",
                message
            );
            Ok(TaskOutcome::Retrying {
                attempt: task.attempts,
                delay,
            })
        } else {
            let failed = self
                .inner
                .store
                .fail(task.id, guard, &error_text, now)
                .await?;
            if !failed {
                return Ok(TaskOutcome::Abandoned);
            }

            error!(
                task_id = %task.id,
                task_name = %task.name,
                attempts = task.attempts,
                "task failed permanently: {}",
                message
            );
            Ok(TaskOutcome::Failed)
        }
    }

    /// Refresh the lease on every row this instance is processing
    pub async fn heartbeat(&self) -> Result<u64, QueueError> {
        let touched = self
            .inner
            .store
            .heartbeat(self.worker_id(), Utc::now())
            .await?;
        if touched > 0 {
            debug!(worker_id = %self.worker_id(), touched, "heartbeat");
        }
        Ok(touched)
    }

    /// Requeue or fail processing rows whose heartbeat went stale
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn recover_stuck_tasks(&self) -> Result<RecoveryReport, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inner.config.stuck_timeout).unwrap_or_default();
        let stuck = self.inner.store.find_stuck(cutoff).await?;

        let mut report = RecoveryReport::default();
        let guard = LeaseGuard::StaleBefore(cutoff);

        for task in stuck {
            let message = format!(
                "recovered after heartbeat timeout (worker {})",
                task.worker_id.as_deref().unwrap_or("unknown")
            );
            match self.retry_or_fail(&task, &guard, &message).await {
                Ok(TaskOutcome::Retrying { .. }) => report.requeued += 1,
                Ok(TaskOutcome::Failed) => report.failed += 1,
                Ok(_) => {}
                Err(e) => error!(task_id = %task.id, "Failed to recover stuck task: {}", e),
            }
        }

        if report.total() > 0 {
            warn!(
                requeued = report.requeued,
                failed = report.failed,
                "recovered stuck tasks"
            );
        }
        Ok(report)
    }

    /// Start the poll, heartbeat and stuck-task loops (no-op if running)
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            debug!("queue already running");
            return Ok(());
        }

        info!(
            worker_id = %self.worker_id(),
            concurrency = self.inner.config.concurrency,
            handlers = ?self.inner.registry.names(),
            "Starting task queue"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(loops::poll_loop(self.clone(), shutdown_rx.clone())),
            tokio::spawn(loops::heartbeat_loop(self.clone(), shutdown_rx.clone())),
            tokio::spawn(loops::stuck_task_loop(self.clone(), shutdown_rx)),
        ];

        *running = Some(RunningState {
            shutdown_tx,
            handles,
        });
        Ok(())
    }

    /// Stop the background loops and wait for them to exit (no-op if stopped)
    ///
    /// Handlers already dispatched keep running to completion.
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn stop(&self) {
        let state = self.inner.running.lock().take();
        let Some(state) = state else {
            return;
        };

        info!(worker_id = %self.worker_id(), "Stopping task queue");
        let _ = state.shutdown_tx.send(true);

        for handle in state.handles {
            if let Err(e) = handle.await {
                error!("Queue loop ended abnormally: {}", e);
            }
        }

        info!(worker_id = %self.worker_id(), "Task queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Counts per status plus this instance's identity and load
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let store = &self.inner.store;
        Ok(QueueStats {
            pending: store.count_by_status(TaskStatus::Pending).await?,
            processing: store.count_by_status(TaskStatus::Processing).await?,
            completed: store.count_by_status(TaskStatus::Completed).await?,
            failed: store.count_by_status(TaskStatus::Failed).await?,
            worker_id: self.worker_id().to_string(),
            in_flight: self.in_flight(),
        })
    }

    /// Delete completed and failed tasks not updated for `older_than_days`
    #[instrument(skip(self))]
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let deleted = self.inner.store.delete_finished_before(cutoff).await?;

        info!(deleted, older_than_days, "cleaned up finished tasks");
        Ok(deleted)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("worker_id", &self.worker_id())
            .field("registry", &self.inner.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
