//! # rowq
//!
//! A relational-store-backed task queue shared by independent worker processes.
//!
//! ## Features
//!
//! - **Leasing without locks**: Tasks are claimed with an ordered select followed by a conditional update
//! - **Priority / FIFO ordering**: Higher priority first, oldest first within a priority
//! - **Bounded concurrency**: Each engine instance runs at most `concurrency` handlers at once
//! - **Automatic retries**: Exponential backoff up to `max_attempts`, then terminal failure
//! - **Crash recovery**: Heartbeat leases and a stuck-task monitor requeue abandoned work
//! - **Recurring tasks**: Self-re-enqueuing schedules stored as ordinary rows
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RecurringScheduler                         │
//! │  (registers one handler, re-adds itself with a future run)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskQueue                              │
//! │  (poll loop, dispatch, retry, heartbeat, stuck recovery)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskStore                              │
//! │  (PostgreSQL: rowq_tasks, or in-memory for tests)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rowq::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = PostgresTaskStore::connect("postgres://localhost/rowq").await?;
//! store.migrate().await?;
//!
//! let queue = TaskQueue::new(Arc::new(store), QueueConfig::from_env())?;
//! queue.register("resize_image", |task| async move {
//!     // ... do the work
//!     Ok(json!({ "resized": task.payload["path"] }))
//! });
//!
//! queue
//!     .add("resize_image", json!({ "path": "a.png" }), AddOptions::new().with_priority(10))
//!     .await?;
//! queue.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod schedule;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        AddOptions, ClaimScope, HandlerResult, QueueConfig, QueueError, QueueStats, TaskOutcome,
        TaskQueue,
    };
    pub use crate::persistence::{
        InMemoryTaskStore, PostgresTaskStore, StoreError, Task, TaskStatus, TaskStore,
    };
    pub use crate::reliability::BackoffPolicy;
    pub use crate::schedule::{every, RecurringScheduler};
}

// Re-export key types at crate root
pub use engine::{
    AddOptions, ClaimScope, HandlerRegistry, HandlerResult, QueueConfig, QueueError, QueueStats,
    RecoveryReport, TaskOutcome, TaskQueue,
};
pub use persistence::{
    ClaimFilter, InMemoryTaskStore, LeaseGuard, NewTask, PostgresTaskStore, StoreError, Task,
    TaskStatus, TaskStore,
};
pub use reliability::BackoffPolicy;
pub use schedule::RecurringScheduler;
