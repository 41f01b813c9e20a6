//! Scheduler / forwarder: promotes due `scheduled`/`retry` entries to
//! `pending`. Per spec.md §4.3 this is one loop per server, not per queue;
//! it simply calls `Forward` for every configured queue on each tick.
//!
//! Skew tolerance: `now` is computed on the server's own clock
//! ([`broker::now_epoch`]) and passed to the script as `ARGV`, since this
//! crate has no independent time source; keeping server clocks NTP-disciplined
//! is an operational requirement, not something this loop can compensate for.

use std::time::Duration;

use anyhow::Result;
use broker::RedisBroker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::Service;

pub struct Scheduler {
    broker: RedisBroker,
    queues: Vec<String>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(broker: RedisBroker, queues: Vec<String>, interval: Duration) -> Self {
        Self {
            broker,
            queues,
            interval,
        }
    }

    async fn tick(&self) {
        for queue in &self.queues {
            match self.broker.forward(queue).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, promoted = n, "forwarded due tasks to pending"),
                Err(e) => warn!(queue = %queue, error = %e, "forward failed"),
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
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
