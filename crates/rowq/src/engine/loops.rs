//! Background loops owned by a started [`TaskQueue`]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::queue::TaskQueue;

/// A dispatched task's concurrency slot; counts as in flight until dropped
struct Dispatch {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatch {
    fn new(permit: OwnedSemaphorePermit, in_flight: &Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            _permit: permit,
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Claim while slots are free, dispatching each claimed task
pub(super) async fn poll_loop(queue: TaskQueue, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = queue.inner.config.polling_interval;
    let slots = queue.inner.slots.clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Block until a slot is free; a finished task releases its permit
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        match queue.claim_next().await {
            Ok(Some(task)) => {
                let dispatch = Dispatch::new(permit, &queue.inner.in_flight);
                let queue = queue.clone();
                tokio::spawn(async move {
                    let task_id = task.id;
                    if let Err(e) = queue.process_task(task).await {
                        error!(%task_id, "Failed to record task outcome: {}", e);
                    }
                    drop(dispatch);
                });
            }
            Ok(None) => {
                drop(permit);
                if wait(&mut shutdown_rx, interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!("Poll failed: {}", e);
                if wait(&mut shutdown_rx, interval).await {
                    break;
                }
            }
        }
    }

    debug!("Poll loop exited");
}

/// Periodically refresh leases on owned rows
pub(super) async fn heartbeat_loop(queue: TaskQueue, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(queue.inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = queue.heartbeat().await {
                    error!("Heartbeat failed: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Heartbeat loop: shutdown requested");
                break;
            }
        }
    }
}

/// Periodically recover rows whose heartbeat went stale
pub(super) async fn stuck_task_loop(queue: TaskQueue, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(queue.inner.config.stuck_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = queue.recover_stuck_tasks().await {
                    error!("Stuck task check failed: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Stuck task loop: shutdown requested");
                break;
            }
        }
    }
}

/// Sleep for `interval`; returns true if shutdown was requested meanwhile
async fn wait(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown_rx.changed() => true,
    }
}
