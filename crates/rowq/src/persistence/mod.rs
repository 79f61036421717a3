//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`TaskStore`] trait, the capability contract the engine needs
//! - [`InMemoryTaskStore`] for tests and embedding
//! - [`PostgresTaskStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{
    ClaimFilter, LeaseGuard, NewTask, StoreError, Task, TaskStatus, TaskStore, TASK_KEY_FIELD,
};
