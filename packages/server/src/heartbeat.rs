//! Heartbeat: publishes server liveness and extends in-flight leases. Per
//! spec.md §4.5, the identity record lives under a TTL-bearing key (TTL = 2x
//! the heartbeat interval) and every currently leased task is extended via
//! `ExtendLease(ids, now + lease_duration)`. On shutdown the roster key is
//! deleted immediately rather than left to expire, so the roster view
//! updates promptly.

use std::time::Duration;

use anyhow::Result;
use broker::{now_epoch, RedisBroker};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::active::ActiveTasks;
use crate::service::Service;

/// Read-only snapshot of one in-flight task, carried in [`HeartbeatRecord`]
/// for a future inspection tool to read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskSnapshot {
    pub id: String,
    pub task_type: String,
    pub queue: String,
    pub started_at: i64,
}

/// The identity record written to `servers:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub server_id: String,
    pub host: String,
    pub pid: u32,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub started_at: i64,
    pub active: Vec<ActiveTaskSnapshot>,
}

pub struct Heartbeat {
    broker: RedisBroker,
    active: ActiveTasks,
    server_id: String,
    host: String,
    pid: u32,
    concurrency: usize,
    queues: Vec<String>,
    started_at: i64,
    interval: Duration,
    lease_duration: Duration,
}

impl Heartbeat {
    pub fn new(
        broker: RedisBroker,
        active: ActiveTasks,
        server_id: String,
        concurrency: usize,
        queues: Vec<String>,
        interval: Duration,
        lease_duration: Duration,
    ) -> Self {
        Self {
            broker,
            active,
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            server_id,
            concurrency,
            queues,
            started_at: now_epoch(),
            interval,
            lease_duration,
        }
    }

    async fn extend_leases(&self) {
        let new_expiry = now_epoch() + self.lease_duration.as_secs() as i64;
        for queue in &self.queues {
            let ids = self.active.ids_for_queue(queue).await;
            if ids.is_empty() {
                continue;
            }
            if let Err(e) = self.broker.extend_lease(queue, &ids, new_expiry).await {
                warn!(queue = %queue, error = %e, "extend_lease failed");
            }
        }
    }

    async fn publish_roster(&self) {
        let snapshot = self.active.snapshot().await;
        let record = HeartbeatRecord {
            server_id: self.server_id.clone(),
            host: self.host.clone(),
            pid: self.pid,
            concurrency: self.concurrency,
            queues: self.queues.clone(),
            started_at: self.started_at,
            active: snapshot
                .into_iter()
                .map(|s| ActiveTaskSnapshot {
                    id: s.id,
                    task_type: s.task_type,
                    queue: s.queue,
                    started_at: s.started_at,
                })
                .collect(),
        };

        match bincode::serialize(&record) {
            Ok(payload) => {
                let ttl = self.interval.as_secs() * 2;
                let key = broker::keys::server(&self.server_id);
                if let Err(e) = self.broker.write_roster_record(&key, &payload, ttl).await {
                    warn!(error = %e, "heartbeat roster write failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat record encoding failed"),
        }
    }

    async fn tick(&self) {
        self.extend_leases().await;
        self.publish_roster().await;
        debug!(server_id = %self.server_id, "heartbeat tick");
    }
}

#[async_trait::async_trait]
impl Service for Heartbeat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        let key = broker::keys::server(&self.server_id);
        if let Err(e) = self.broker.delete_roster_record(&key).await {
            warn!(error = %e, "failed to delete roster record on shutdown");
        }
        Ok(())
    }
}
