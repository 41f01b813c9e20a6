//! Recoverer: requeues tasks whose lease expired because their worker
//! crashed. Per spec.md §4.4: requeue goes to the head of `pending` and
//! preserves `retried` (recovery does not consume a retry); a task whose
//! effective deadline has already passed is archived instead, with error
//! `"deadline exceeded"`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use broker::{now_epoch, RedisBroker, Task};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::service::Service;

pub struct Recoverer {
    broker: RedisBroker,
    queues: Vec<String>,
    interval: Duration,
    archive_capacity: u64,
    max_parallel: usize,
}

impl Recoverer {
    pub fn new(broker: RedisBroker, queues: Vec<String>, interval: Duration, archive_capacity: u64) -> Self {
        Self {
            broker,
            queues,
            interval,
            archive_capacity,
            max_parallel: 16,
        }
    }

    async fn tick(&self) {
        for queue in &self.queues {
            let ids = match self.broker.list_lease_expired(queue, now_epoch()).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "list_lease_expired failed");
                    continue;
                }
            };
            if ids.is_empty() {
                continue;
            }

            let blobs = match self.broker.get_task_blobs(queue, &ids).await {
                Ok(blobs) => blobs,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "fetching expired task blobs failed");
                    continue;
                }
            };

            let semaphore = Arc::new(Semaphore::new(self.max_parallel));
            let mut handles = Vec::with_capacity(ids.len());
            for (id, blob) in ids.into_iter().zip(blobs) {
                let broker = self.broker.clone();
                let queue = queue.clone();
                let capacity = self.archive_capacity;
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("recoverer semaphore never closes");
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    recover_one(&broker, &queue, &id, blob, capacity).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

async fn recover_one(broker: &RedisBroker, queue: &str, id: &str, blob: Option<Vec<u8>>, archive_capacity: u64) {
    let Some(blob) = blob else {
        warn!(queue, task_id = %id, "lease expired but blob missing; requeueing anyway");
        if let Err(e) = broker.requeue(queue, id).await {
            error!(queue, task_id = %id, error = %e, "requeue failed");
        }
        return;
    };

    let task = match Task::decode(&blob) {
        Ok(task) => task,
        Err(e) => {
            error!(queue, task_id = %id, error = %e, "decode failed during recovery");
            return;
        }
    };

    let now = now_epoch();
    if task.effective_deadline(now).map(|d| now >= d).unwrap_or(false) {
        match broker.archive_recovered(&task, "deadline exceeded", archive_capacity).await {
            Ok(()) => warn!(queue, task_id = %id, "archived on recovery: deadline exceeded"),
            Err(e) => error!(queue, task_id = %id, error = %e, "archive during recovery failed"),
        }
        return;
    }

    match broker.requeue(queue, id).await {
        Ok(()) => info!(queue, task_id = %id, "requeued after lease expiry"),
        Err(e) => error!(queue, task_id = %id, error = %e, "requeue failed"),
    }
}

#[async_trait::async_trait]
impl Service for Recoverer {
    fn name(&self) -> &'static str {
        "recoverer"
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
