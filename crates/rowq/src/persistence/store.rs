//! TaskStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Unknown status value read back from the store
    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),
}

/// Task status
///
/// `Pending` and `Processing` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed once `run_at` has passed
    Pending,

    /// Leased by a worker
    Processing,

    /// Handler succeeded
    Completed,

    /// Retries exhausted, or no handler registered
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Doubles as the lease heartbeat while `Processing`
    pub updated_at: DateTime<Utc>,
}

/// Payload field that routes a row to one keyed handler
pub const TASK_KEY_FIELD: &str = "task_key";

impl Task {
    /// Whether another attempt is allowed after the current one
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The payload's `task_key`, if it has a string one
    pub fn task_key(&self) -> Option<&str> {
        self.payload
            .get(TASK_KEY_FIELD)
            .and_then(serde_json::Value::as_str)
    }
}

/// A task to be inserted
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub max_attempts: u32,
}

/// Which pending rows a claim may select
///
/// A name that appears in `keyed` is only claimable for the listed
/// `(name, task_key)` pairs. Rows of that name with any other key are left
/// for whichever engine registered their key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Match every name that is not keyed
    pub any_name: bool,

    /// Unkeyed names to match when `any_name` is false
    pub names: Vec<String>,

    /// Claimable `(name, task_key)` pairs
    pub keyed: Vec<(String, String)>,
}

impl ClaimFilter {
    /// Match every row
    pub fn all() -> Self {
        Self {
            any_name: true,
            ..Self::default()
        }
    }

    /// Match rows with one of `names`
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Also match rows named `name` whose payload `task_key` is `key`
    pub fn with_key(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.keyed.push((name.into(), key.into()));
        self
    }

    /// Whether no row can match
    pub fn is_empty(&self) -> bool {
        !self.any_name && self.names.is_empty() && self.keyed.is_empty()
    }

    fn is_keyed(&self, name: &str) -> bool {
        self.keyed.iter().any(|(n, _)| n == name)
    }

    /// Evaluate the filter against a row (used by non-SQL backends)
    pub fn matches(&self, task: &Task) -> bool {
        if self.is_keyed(&task.name) {
            let key = task.task_key();
            return self
                .keyed
                .iter()
                .any(|(n, k)| *n == task.name && Some(k.as_str()) == key);
        }
        self.any_name || self.names.iter().any(|n| *n == task.name)
    }
}

/// Scope of a conditional update on a `Processing` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGuard {
    /// Row must still be leased by this worker
    Owner(String),

    /// Row's heartbeat must still be older than the cutoff
    StaleBefore(DateTime<Utc>),
}

impl LeaseGuard {
    /// Evaluate the guard against a row (used by non-SQL backends)
    pub fn matches(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Processing {
            return false;
        }
        match self {
            Self::Owner(worker_id) => task.worker_id.as_deref() == Some(worker_id.as_str()),
            Self::StaleBefore(cutoff) => task.updated_at < *cutoff,
        }
    }
}

/// Store for task rows
///
/// Every state transition is a conditional update: it only applies when the
/// row is still in the expected state, and reports whether it applied. This
/// is the only concurrency control the queue relies on.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new `Pending` task; the store assigns id and timestamps
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Point lookup
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Highest-priority, oldest `Pending` task with `run_at <= now` that
    /// `filter` matches
    async fn find_next_pending(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Conditionally move a task `Pending -> Processing`
    ///
    /// Returns the claimed row, or `None` when another claimant won.
    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Conditionally move a task owned by `worker_id` to `Completed`
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Conditionally release a `Processing` task back to `Pending`
    async fn requeue(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Conditionally hand a task owned by `worker_id` back to `Pending` as if
    /// it had never been claimed: the claim's attempt is undone and `run_at`
    /// is kept
    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Conditionally move a `Processing` task to `Failed`
    async fn fail(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Touch `updated_at` on every `Processing` row owned by `worker_id`
    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// `Processing` rows whose heartbeat is older than `cutoff`
    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Number of rows in a status
    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError>;

    /// Number of `Pending` rows named `name` whose payload `task_key` equals `key`
    async fn count_pending_for_key(&self, name: &str, key: &str) -> Result<u64, StoreError>;

    /// Delete terminal rows last updated before `cutoff`
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
