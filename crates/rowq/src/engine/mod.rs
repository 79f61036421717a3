//! Task queue engine
//!
//! This module provides:
//! - [`TaskQueue`] - Polling, claiming, dispatch, retry and recovery
//! - [`HandlerRegistry`] - Per-engine mapping from task name (and optionally
//!   payload `task_key`) to handler
//! - [`QueueConfig`] - Engine configuration with environment overrides
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Poll loop  │  │  Heartbeat  │  │  Stuck-task monitor │  │
//! │  │   (1s)      │  │   (30s)     │  │       (60s)         │  │
//! │  └──────┬──────┘  └─────────────┘  └─────────────────────┘  │
//! │         │ select + conditional update                        │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      Dispatch (Semaphore-limited, `concurrency`)     │    │
//! │  │  [Task 1] [Task 2] ... [Task N]  -> HandlerRegistry  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod loops;
mod queue;
mod registry;

pub use config::{ClaimScope, QueueConfig};
pub use queue::{
    AddOptions, QueueError, QueueStats, RecoveryReport, TaskOutcome, TaskQueue,
    DEFAULT_MAX_ATTEMPTS,
};
pub use registry::{HandlerRegistry, HandlerResult, Resolved, TaskHandler};
