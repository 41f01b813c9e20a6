//! Janitor: deletes expired completed tasks and trims `archived` beyond
//! capacity. Per spec.md §4.6, wakes every `janitor_interval` (default 8s)
//! and, for each queue, calls `DeleteExpiredCompleted` then `TrimArchived`.

use std::time::Duration;

use anyhow::Result;
use broker::RedisBroker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::Service;

pub struct Janitor {
    broker: RedisBroker,
    queues: Vec<String>,
    interval: Duration,
    batch_size: u64,
    archive_capacity: u64,
}

impl Janitor {
    pub fn new(
        broker: RedisBroker,
        queues: Vec<String>,
        interval: Duration,
        batch_size: u64,
        archive_capacity: u64,
    ) -> Self {
        Self {
            broker,
            queues,
            interval,
            batch_size,
            archive_capacity,
        }
    }

    async fn tick(&self) {
        for queue in &self.queues {
            match self.broker.delete_expired_completed(queue, self.batch_size).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, reaped = n, "deleted expired completed tasks"),
                Err(e) => warn!(queue = %queue, error = %e, "delete_expired_completed failed"),
            }

            match self.broker.trim_archived(queue, self.archive_capacity).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, evicted = n, "trimmed archived over capacity"),
                Err(e) => warn!(queue = %queue, error = %e, "trim_archived failed"),
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for Janitor {
    fn name(&self) -> &'static str {
        "janitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        Ok(())
    }
}
