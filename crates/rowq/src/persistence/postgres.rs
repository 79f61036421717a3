//! PostgreSQL implementation of TaskStore
//!
//! Every transition is a single `UPDATE ... WHERE id = $1 AND status = ...`
//! whose affected-row count (or `RETURNING` row) tells the caller whether it
//! won. Selection is a plain ordered `SELECT`; no row locks are held between
//! the two phases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

const TASK_COLUMNS: &str = r#"
    id, name, payload, status, priority, run_at, attempts, max_attempts,
    worker_id, started_at, completed_at, result, error, created_at, updated_at
"#;

/// PostgreSQL implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use rowq::PostgresTaskStore;
///
/// let store = PostgresTaskStore::connect("postgres://localhost/mydb").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool to `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Run the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Migration(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_name = %task.name))]
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO rowq_tasks (id, name, payload, status, priority, run_at, max_attempts)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&task.name)
        .bind(&task.payload)
        .bind(task.priority)
        .bind(task.run_at)
        .bind(to_db_count(task.max_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let task = row_to_task(&row)?;
        debug!(task_id = %task.id, "inserted task");
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM rowq_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn find_next_pending(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let (keyed_names, keyed_keys): (Vec<String>, Vec<String>) =
            filter.keyed.iter().cloned().unzip();

        // Keyed names only match their listed task keys; every other name
        // matches when it is listed or when any name is allowed
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM rowq_tasks t
            WHERE status = 'pending'
              AND run_at <= $1
              AND (
                EXISTS (
                    SELECT 1 FROM unnest($4::text[], $5::text[]) AS k(name, task_key)
                    WHERE k.name = t.name AND k.task_key = t.payload->>'task_key'
                )
                OR (
                    NOT (t.name = ANY($4::text[]))
                    AND ($2::boolean OR t.name = ANY($3::text[]))
                )
              )
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(now)
        .bind(filter.any_name)
        .bind(&filter.names)
        .bind(&keyed_names)
        .bind(&keyed_keys)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to select pending task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE rowq_tasks
            SET status = 'processing',
                worker_id = $2,
                started_at = $3,
                completed_at = NULL,
                attempts = attempts + 1,
                error = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'pending' AND run_at <= $3
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => {
                let task = row_to_task(&row)?;
                debug!(task_id = %id, attempt = task.attempts, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE rowq_tasks
            SET status = 'completed',
                result = $3,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(&result)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn requeue(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = match guard {
            LeaseGuard::Owner(worker_id) => sqlx::query(
                r#"
                UPDATE rowq_tasks
                SET status = 'pending', worker_id = NULL, run_at = $2, error = $3, updated_at = $4
                WHERE id = $1 AND status = 'processing' AND worker_id = $5
                "#,
            )
            .bind(id)
            .bind(run_at)
            .bind(error)
            .bind(now)
            .bind(worker_id.as_str()),
            LeaseGuard::StaleBefore(cutoff) => sqlx::query(
                r#"
                UPDATE rowq_tasks
                SET status = 'pending', worker_id = NULL, run_at = $2, error = $3, updated_at = $4
                WHERE id = $1 AND status = 'processing' AND updated_at < $5
                "#,
            )
            .bind(id)
            .bind(run_at)
            .bind(error)
            .bind(now)
            .bind(*cutoff),
        };

        let outcome = query.execute(&self.pool).await.map_err(|e| {
            error!("Failed to requeue task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE rowq_tasks
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                attempts = GREATEST(attempts - 1, 0),
                updated_at = $3
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn fail(
        &self,
        id: Uuid,
        guard: &LeaseGuard,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = match guard {
            LeaseGuard::Owner(worker_id) => sqlx::query(
                r#"
                UPDATE rowq_tasks
                SET status = 'failed', error = $2, completed_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'processing' AND worker_id = $4
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(now)
            .bind(worker_id.as_str()),
            LeaseGuard::StaleBefore(cutoff) => sqlx::query(
                r#"
                UPDATE rowq_tasks
                SET status = 'failed', error = $2, completed_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'processing' AND updated_at < $4
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(now)
            .bind(*cutoff),
        };

        let outcome = query.execute(&self.pool).await.map_err(|e| {
            error!("Failed to fail task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE rowq_tasks
            SET updated_at = $2
            WHERE worker_id = $1 AND status = 'processing'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to heartbeat tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM rowq_tasks
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find stuck tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rowq_tasks WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn count_pending_for_key(&self, name: &str, key: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM rowq_tasks
            WHERE status = 'pending' AND name = $1 AND payload->>'task_key' = $2
            "#,
        )
        .bind(name)
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count pending tasks for key: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let outcome = sqlx::query(
            r#"
            DELETE FROM rowq_tasks
            WHERE status IN ('completed', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete finished tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(deleted = outcome.rows_affected(), "deleted finished tasks");
        Ok(outcome.rows_affected())
    }
}

// Helper functions

fn row_to_task(row: &PgRow) -> Result<Task, StoreError> {
    let column_err = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let status: String = row.try_get("status").map_err(column_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(column_err)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(column_err)?;

    Ok(Task {
        id: row.try_get("id").map_err(column_err)?,
        name: row.try_get("name").map_err(column_err)?,
        payload: row.try_get("payload").map_err(column_err)?,
        status: status.parse()?,
        priority: row.try_get("priority").map_err(column_err)?,
        run_at: row.try_get("run_at").map_err(column_err)?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        worker_id: row.try_get("worker_id").map_err(column_err)?,
        started_at: row.try_get("started_at").map_err(column_err)?,
        completed_at: row.try_get("completed_at").map_err(column_err)?,
        result: row.try_get("result").map_err(column_err)?,
        error: row.try_get("error").map_err(column_err)?,
        created_at: row.try_get("created_at").map_err(column_err)?,
        updated_at: row.try_get("updated_at").map_err(column_err)?,
    })
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database
    // Run with: cargo test -p rowq --test postgres_integration_test -- --ignored --test-threads=1

    use super::to_db_count;

    #[test]
    fn test_to_db_count_saturates() {
        assert_eq!(to_db_count(3), 3);
        assert_eq!(to_db_count(u32::MAX), i32::MAX);
    }
}
