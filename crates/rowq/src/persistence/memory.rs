//! In-memory implementation of TaskStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Stored row plus its insertion sequence (FIFO tie-break)
struct Entry {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Tables {
    next_seq: u64,
    tasks: HashMap<Uuid, Entry>,
}

/// In-memory implementation of TaskStore
///
/// Provides the same semantics as the PostgreSQL implementation. Every
/// conditional update runs under the write lock, which makes it the
/// compare-and-swap the engine relies on.
///
/// # Example
///
/// ```
/// use rowq::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    inner: RwLock<Tables>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
        }
    }

    /// Get the number of stored tasks
    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Snapshot of every stored task in insertion order
    pub fn all_tasks(&self) -> Vec<Task> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.tasks.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    /// Overwrite a task's heartbeat (for simulating crashed workers)
    pub fn set_updated_at(&self, id: Uuid, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let entry = inner
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        entry.task.updated_at = updated_at;
        Ok(())
    }

    /// Clear all data
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tasks.clear();
        inner.next_seq = 0;
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::now_v7(),
            name: new_task.name,
            payload: new_task.payload,
            status: TaskStatus::Pending,
            priority: new_task.priority,
            run_at: new_task.run_at,
            attempts: 0,
            max_attempts: new_task.max_attempts,
            worker_id: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.insert(
            task.id,
            Entry {
                seq,
                task: task.clone(),
            },
        );
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().tasks.get(&id).map(|e| e.task.clone()))
    }

    async fn find_next_pending(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read();
        let next = inner
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Pending && e.task.run_at <= now)
            .filter(|e| filter.matches(&e.task))
            .min_by(|a, b| {
                b.task
                    .priority
                    .cmp(&a.task.priority)
                    .then(a.task.created_at.cmp(&b.task.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|e| e.task.clone());
        Ok(next)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        let task = &mut entry.task;
        if task.status != TaskStatus::Pending || task.run_at > now {
            return Ok(None);
        }

        task.status = TaskStatus::Processing;
        task.worker_id = Some(worker_id.to_string());
        task.started_at = Some(now);
        task.completed_at = None;
        task.attempts += 1;
        task.error = None;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if !LeaseGuard::Owner(worker_id.to_string()).matches(task) {
            return Ok(false);
        }

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn requeue(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if !guard.matches(task) {
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.run_at = run_at;
        task.error = Some(error.to_string());
        task.updated_at = now;
        Ok(true)
    }

    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if !LeaseGuard::Owner(worker_id.to_string()).matches(task) {
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.started_at = None;
        task.attempts = task.attempts.saturating_sub(1);
        task.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if !guard.matches(task) {
            return Ok(false);
        }

        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut touched = 0;
        for entry in inner.tasks.values_mut() {
            let task = &mut entry.task;
            if task.status == TaskStatus::Processing
                && task.worker_id.as_deref() == Some(worker_id)
            {
                task.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read();
        let mut stuck: Vec<&Entry> = inner
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Processing && e.task.updated_at < cutoff)
            .collect();
        stuck.sort_by_key(|e| e.seq);
        Ok(stuck.into_iter().map(|e| e.task.clone()).collect())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|e| e.task.status == status)
            .count() as u64)
    }

    async fn count_pending_for_key(&self, name: &str, key: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Pending
                    && e.task.name == name
                    && e.task.task_key() == Some(key)
            })
            .count() as u64)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, e| !(e.task.status.is_terminal() && e.task.updated_at < cutoff));
        Ok((before - inner.tasks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task(name: &str, priority: i32) -> NewTask {
        NewTask {
            name: name.to_string(),
            payload: json!({}),
            priority,
            run_at: Utc::now(),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("send_email", 0)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.worker_id.is_none());

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(store.get(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("send_email", 0)).await.unwrap();
        let now = Utc::now();

        let claimed = store.claim(task.id, "worker-a", now).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));

        // Second claimant loses
        assert!(store.claim(task.id, "worker-b", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_run_at() {
        let store = InMemoryTaskStore::new();
        let mut later = new_task("send_email", 0);
        later.run_at = Utc::now() + chrono::Duration::seconds(60);
        let task = store.insert(later).await.unwrap();

        assert!(store
            .find_next_pending(&ClaimFilter::all(), Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store.claim(task.id, "worker-a", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_next_pending_order_and_filter() {
        let store = InMemoryTaskStore::new();
        let low = store.insert(new_task("a", 1)).await.unwrap();
        let high = store.insert(new_task("b", 5)).await.unwrap();
        let now = Utc::now();

        let next = store
            .find_next_pending(&ClaimFilter::all(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, high.id);

        let next = store
            .find_next_pending(&ClaimFilter::names(["a"]), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, low.id);

        assert!(store
            .find_next_pending(&ClaimFilter::default(), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_next_pending_skips_foreign_keys() {
        let store = InMemoryTaskStore::new();
        let mut foreign = new_task("shared", 9);
        foreign.payload = json!({ "task_key": "b" });
        store.insert(foreign).await.unwrap();
        let mut own = new_task("shared", 0);
        own.payload = json!({ "task_key": "a" });
        let own = store.insert(own).await.unwrap();

        let filter = ClaimFilter::all().with_key("shared", "a");
        let next = store
            .find_next_pending(&filter, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, own.id);
    }

    #[tokio::test]
    async fn test_release_undoes_the_claim() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("send_email", 0)).await.unwrap();
        let now = Utc::now();
        store.claim(task.id, "worker-a", now).await.unwrap();

        assert!(!store.release(task.id, "worker-b", now).await.unwrap());
        assert!(store.release(task.id, "worker-a", now).await.unwrap());

        let released = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert!(released.worker_id.is_none());
        assert!(released.started_at.is_none());
        assert_eq!(released.run_at, task.run_at);

        // Only a processing row can be released
        assert!(!store.release(task.id, "worker-a", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_requires_owner() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("send_email", 0)).await.unwrap();
        let now = Utc::now();
        store.claim(task.id, "worker-a", now).await.unwrap();

        assert!(!store
            .complete(task.id, "worker-b", json!(1), now)
            .await
            .unwrap());
        assert!(store
            .complete(task.id, "worker-a", json!(1), now)
            .await
            .unwrap());

        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!(1)));
        assert!(done.completed_at.is_some());

        // Terminal rows never move again
        let guard = LeaseGuard::Owner("worker-a".to_string());
        assert!(!store.requeue(task.id, &guard, now, "x", now).await.unwrap());
        assert!(!store.fail(task.id, &guard, "x", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_and_heartbeat() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("send_email", 0)).await.unwrap();
        let now = Utc::now();
        store.claim(task.id, "worker-a", now).await.unwrap();

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(store.heartbeat("worker-a", later).await.unwrap(), 1);
        assert_eq!(store.heartbeat("worker-b", later).await.unwrap(), 0);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().updated_at, later);

        let guard = LeaseGuard::Owner("worker-a".to_string());
        let retry_at = later + chrono::Duration::seconds(1);
        assert!(store
            .requeue(task.id, &guard, retry_at, "attempt 1/3: boom", later)
            .await
            .unwrap());

        let requeued = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.worker_id.is_none());
        assert_eq!(requeued.run_at, retry_at);
        assert_eq!(requeued.error.as_deref(), Some("attempt 1/3: boom"));
    }

    #[tokio::test]
    async fn test_find_stuck_and_cleanup() {
        let store = InMemoryTaskStore::new();
        let stale = store.insert(new_task("a", 0)).await.unwrap();
        let finished = store.insert(new_task("b", 0)).await.unwrap();
        let now = Utc::now();

        store.claim(stale.id, "worker-a", now).await.unwrap();
        store
            .set_updated_at(stale.id, now - chrono::Duration::seconds(600))
            .unwrap();

        store.claim(finished.id, "worker-a", now).await.unwrap();
        store
            .complete(finished.id, "worker-a", json!(null), now)
            .await
            .unwrap();
        store
            .set_updated_at(finished.id, now - chrono::Duration::days(10))
            .unwrap();

        let cutoff = now - chrono::Duration::seconds(90);
        let stuck = store.find_stuck(cutoff).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, stale.id);

        let deleted = store
            .delete_finished_before(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_count_pending_for_key() {
        let store = InMemoryTaskStore::new();
        let mut task = new_task("recurring:digest", 0);
        task.payload = json!({ "task_key": "digest" });
        store.insert(task).await.unwrap();

        assert_eq!(
            store
                .count_pending_for_key("recurring:digest", "digest")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_pending_for_key("recurring:digest", "other")
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.count_by_status(TaskStatus::Pending).await.unwrap(), 1);
    }
}
