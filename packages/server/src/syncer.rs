//! Syncer: local retry queue for settle operations that failed to reach the
//! store. Per spec.md §4.10, a failed `done`/`retry`/`archive` call is
//! handed off here instead of being dropped on the spot; this loop retries
//! it with exponential backoff up to a deadline (default = lease duration),
//! after which it logs and drops — the recoverer's lease-expiry sweep is
//! the backstop that eventually reclaims the task.

use std::time::Duration;

use anyhow::Result;
use broker::{BrokerError, RedisBroker, Task};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::service::Service;

/// One settle call that a caller could not complete against the store.
#[derive(Debug)]
pub enum SettleOp {
    Done(Task),
    Retry {
        task: Task,
        retry_at: i64,
        err: String,
    },
    Archive {
        task: Task,
        err: String,
        capacity: u64,
    },
}

impl SettleOp {
    fn task_id(&self) -> &str {
        match self {
            SettleOp::Done(task) => &task.id,
            SettleOp::Retry { task, .. } => &task.id,
            SettleOp::Archive { task, .. } => &task.id,
        }
    }

    async fn attempt(&self, broker: &RedisBroker) -> Result<(), BrokerError> {
        match self {
            SettleOp::Done(task) => broker.done(task).await,
            SettleOp::Retry { task, retry_at, err } => broker.retry(task, *retry_at, err).await,
            SettleOp::Archive { task, err, capacity } => broker.archive(task, err, *capacity).await,
        }
    }
}

/// Producer-side handle: cheap to clone, held by every [`crate::processor::Processor`]
/// worker so a failed settle can be handed off without blocking the worker
/// slot on further retries.
#[derive(Clone)]
pub struct Syncer {
    sender: mpsc::UnboundedSender<SettleOp>,
}

impl Syncer {
    /// Build a syncer handle plus the receiver its background service owns.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SettleOp>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, op: SettleOp) {
        if self.sender.send(op).is_err() {
            error!("syncer channel closed, settle operation dropped");
        }
    }
}

/// The background service draining [`Syncer`]'s channel.
pub struct SyncerService {
    broker: RedisBroker,
    receiver: mpsc::UnboundedReceiver<SettleOp>,
    deadline: Duration,
}

impl SyncerService {
    pub fn new(broker: RedisBroker, receiver: mpsc::UnboundedReceiver<SettleOp>, deadline: Duration) -> Self {
        Self {
            broker,
            receiver,
            deadline,
        }
    }

    async fn drain_one(&self, op: SettleOp) {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op.attempt(&self.broker).await {
                Ok(()) => return,
                Err(e) if !e.is_transient() => {
                    error!(task_id = %op.task_id(), error = %e, "syncer settle failed permanently");
                    return;
                }
                Err(e) => {
                    if started.elapsed() >= self.deadline {
                        error!(
                            task_id = %op.task_id(),
                            error = %e,
                            "syncer deadline exceeded, dropping settle; recoverer will reclaim it"
                        );
                        return;
                    }
                    attempt += 1;
                    let backoff = backoff_for(attempt);
                    warn!(task_id = %op.task_id(), error = %e, attempt, ?backoff, "syncer retrying settle");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(2u64.saturating_pow(attempt.min(10)));
    Duration::from_millis(base_ms.min(30_000))
}

#[async_trait::async_trait]
impl Service for SyncerService {
    fn name(&self) -> &'static str {
        "syncer"
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe_op = self.receiver.recv() => {
                    match maybe_op {
                        Some(op) => self.drain_one(op).await,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b1 = backoff_for(1);
        let b10 = backoff_for(10);
        assert!(b10 > b1);
        assert!(backoff_for(30).as_millis() <= 30_000);
    }
}
