//! Recurring schedules on top of the task queue

mod recurring;

pub use recurring::{every, NextRunFn, RecurringCallback, RecurringScheduler};
