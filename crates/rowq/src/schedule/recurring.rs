//! Recurring scheduler
//!
//! A recurrence is just data: one pending row per schedule whose payload
//! carries the schedule's `task_key`. Firing that row runs the callback and
//! enqueues the next occurrence, so the chain survives restarts.
//!
//! Several schedules may share one task name. Each registers a keyed handler
//! for its own `task_key`, so a row only ever reaches the schedule it belongs
//! to and rows of keys served elsewhere are left alone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::engine::{HandlerResult, QueueError, TaskQueue, DEFAULT_MAX_ATTEMPTS};
use crate::persistence::{NewTask, StoreError, Task, TaskStore, TASK_KEY_FIELD};

/// Computes the next occurrence from the previous one
pub type NextRunFn = Arc<dyn Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync>;

/// User logic executed on every occurrence
pub type RecurringCallback = Arc<dyn Fn(Task) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Fixed-cadence `next_run`: each occurrence `interval` after the previous one
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use std::time::Duration;
///
/// let next = rowq::schedule::every(Duration::from_secs(3600));
/// let last = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(next(last), Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap());
/// ```
pub fn every(interval: Duration) -> impl Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync + Clone {
    let step = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
    move |last| last.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Shared between the scheduler and its registered handler
struct Schedule {
    task_key: String,
    task_name: String,
    priority: i32,
    max_attempts: u32,
    callback: RecurringCallback,
    next_run: NextRunFn,
    store: Arc<dyn TaskStore>,
}

impl Schedule {
    fn payload(&self) -> Value {
        json!({ TASK_KEY_FIELD: self.task_key })
    }

    async fn has_pending(&self) -> Result<bool, StoreError> {
        Ok(self
            .store
            .count_pending_for_key(&self.task_name, &self.task_key)
            .await?
            > 0)
    }

    async fn enqueue(&self, run_at: DateTime<Utc>) -> Result<Task, StoreError> {
        self.store
            .insert(NewTask {
                name: self.task_name.clone(),
                payload: self.payload(),
                priority: self.priority,
                run_at,
                max_attempts: self.max_attempts,
            })
            .await
    }

    /// Next occurrence after `last_run`, never in the past
    fn next_after(&self, last_run: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = (self.next_run)(last_run);
        if next > now {
            next
        } else {
            // Skip missed slots instead of replaying them
            (self.next_run)(now)
        }
    }

    /// Enqueue the occurrence after `last_run` unless one is already pending
    async fn schedule_next(&self, last_run: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        if self.has_pending().await? {
            debug!(task_key = %self.task_key, "next occurrence already pending");
            return Ok(None);
        }

        let next = self.next_after(last_run, Utc::now());
        self.enqueue(next).await?;
        debug!(task_key = %self.task_key, next_run_at = %next, "scheduled next occurrence");
        Ok(Some(next))
    }

    async fn fire(self: Arc<Self>, task: Task) -> HandlerResult {
        let last_run = task.run_at;
        let outcome = (self.callback)(task).await;

        // The chain continues even when this occurrence failed
        let next_run_at = self.schedule_next(last_run).await?;

        let result = outcome?;
        Ok(json!({
            "task_key": self.task_key,
            "result": result,
            "next_run_at": next_run_at,
        }))
    }
}

/// Self-re-enqueuing recurring task on top of a [`TaskQueue`]
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use chrono::Utc;
/// use rowq::schedule::{every, RecurringScheduler};
/// use rowq::{InMemoryTaskStore, QueueConfig, TaskQueue};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), rowq::QueueError> {
/// let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()), QueueConfig::default())?;
///
/// let digest = RecurringScheduler::new(
///     queue,
///     "daily-digest",
///     every(Duration::from_secs(24 * 3600)),
///     |_task| async { Ok(json!({ "sent": true })) },
/// );
///
/// digest.start(Utc::now()).await?;
/// # Ok(())
/// # }
/// ```
pub struct RecurringScheduler {
    queue: TaskQueue,
    schedule: Arc<Schedule>,
}

impl RecurringScheduler {
    /// Create a scheduler for `task_key` using the task name `recurring:<task_key>`
    pub fn new<N, F, Fut>(queue: TaskQueue, task_key: impl Into<String>, next_run: N, callback: F) -> Self
    where
        N: Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync + 'static,
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let task_key = task_key.into();
        let callback: RecurringCallback = Arc::new(move |task| callback(task).boxed());

        Self {
            schedule: Arc::new(Schedule {
                task_name: format!("recurring:{}", task_key),
                task_key,
                priority: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                callback,
                next_run: Arc::new(next_run),
                store: Arc::clone(queue.store()),
            }),
            queue,
        }
    }

    /// Override the task name rows are stored under
    pub fn with_task_name(self, name: impl Into<String>) -> Self {
        self.map_schedule(|s| s.task_name = name.into())
    }

    /// Priority for every occurrence
    pub fn with_priority(self, priority: i32) -> Self {
        self.map_schedule(|s| s.priority = priority)
    }

    /// Attempt ceiling for every occurrence (at least 1)
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.map_schedule(|s| s.max_attempts = max_attempts.max(1))
    }

    fn map_schedule(self, f: impl FnOnce(&mut Schedule)) -> Self {
        let Self { queue, schedule } = self;
        let mut schedule = match Arc::try_unwrap(schedule) {
            Ok(schedule) => schedule,
            Err(shared) => Schedule {
                task_key: shared.task_key.clone(),
                task_name: shared.task_name.clone(),
                priority: shared.priority,
                max_attempts: shared.max_attempts,
                callback: Arc::clone(&shared.callback),
                next_run: Arc::clone(&shared.next_run),
                store: Arc::clone(&shared.store),
            },
        };
        f(&mut schedule);
        Self {
            queue,
            schedule: Arc::new(schedule),
        }
    }

    pub fn task_key(&self) -> &str {
        &self.schedule.task_key
    }

    pub fn task_name(&self) -> &str {
        &self.schedule.task_name
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Register this schedule's key, start the engine and seed the first occurrence
    ///
    /// Returns whether a row was seeded; an already pending occurrence is
    /// left alone, so calling this again is harmless.
    #[instrument(skip(self), fields(task_key = %self.schedule.task_key))]
    pub async fn start(&self, first_run_at: DateTime<Utc>) -> Result<bool, QueueError> {
        let schedule = Arc::clone(&self.schedule);
        self.queue.register_keyed(
            self.schedule.task_name.clone(),
            self.schedule.task_key.clone(),
            move |task| Arc::clone(&schedule).fire(task),
        );

        self.queue.start().await?;

        if self.schedule.has_pending().await? {
            debug!("recurring task already scheduled");
            return Ok(false);
        }

        let task = self.schedule.enqueue(first_run_at).await?;
        info!(
            task_id = %task.id,
            task_name = %self.schedule.task_name,
            run_at = %first_run_at,
            "seeded recurring task"
        );
        Ok(true)
    }

    /// Stop the underlying engine; the pending occurrence stays in the store
    pub async fn stop(&self) {
        self.queue.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::QueueConfig;

    fn scheduler(next_run: impl Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync + 'static) -> RecurringScheduler {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()), QueueConfig::default()).unwrap();
        RecurringScheduler::new(queue, "digest", next_run, |_task| async { Ok(json!(null)) })
    }

    #[test]
    fn test_default_task_name() {
        let s = scheduler(every(Duration::from_secs(60)));
        assert_eq!(s.task_key(), "digest");
        assert_eq!(s.task_name(), "recurring:digest");

        let s = s.with_task_name("digest-job").with_max_attempts(0);
        assert_eq!(s.task_name(), "digest-job");
        assert_eq!(s.schedule.max_attempts, 1);
    }

    #[test]
    fn test_next_after_keeps_future_slot() {
        let s = scheduler(every(Duration::from_secs(60)));
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(30);

        assert_eq!(s.schedule.next_after(last, now), last + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_next_after_skips_missed_slots() {
        let s = scheduler(every(Duration::from_secs(60)));
        let now = Utc::now();
        let last = now - chrono::Duration::hours(5);

        assert_eq!(s.schedule.next_after(last, now), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_every_saturates() {
        let next = every(Duration::from_secs(u64::MAX));
        assert_eq!(next(Utc::now()), DateTime::<Utc>::MAX_UTC);
    }
}
