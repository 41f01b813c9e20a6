//! Processor: the main fetch -> run handler -> settle loop. Implements
//! spec.md §4.2 steps 1-9: a bounded worker pool acquires a slot, chooses a
//! queue-selection order honoring priority, dequeues under a fresh lease,
//! runs the registered handler bounded by a deadline and a cancellation
//! signal, and settles the outcome (done/retry/archive) back through the
//! broker — routing a failed settle call to the syncer instead of dropping
//! it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use broker::{now_epoch, RedisBroker, Task};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::active::{ActiveTaskHandle, ActiveTasks};
use crate::config::{Config, Policy};
use crate::registry::{HandlerRegistry, TaskContext};
use crate::service::Service;
use crate::syncer::{SettleOp, Syncer};

pub struct Processor {
    broker: RedisBroker,
    config: Config,
    policy: Policy,
    handlers: Arc<HandlerRegistry>,
    active: ActiveTasks,
    syncer: Syncer,
}

impl Processor {
    pub fn new(
        broker: RedisBroker,
        config: Config,
        policy: Policy,
        handlers: Arc<HandlerRegistry>,
        active: ActiveTasks,
        syncer: Syncer,
    ) -> Self {
        Self {
            broker,
            config,
            policy,
            handlers,
            active,
            syncer,
        }
    }

    /// Order queues for one dequeue round. `strict_priority` sorts
    /// descending by weight with ties shuffled within their tier; otherwise
    /// queues are sampled without replacement, weighted, matching spec.md
    /// §4.2 step 2.
    fn select_queues(&self) -> Vec<String> {
        order_queues(self.config.queues_by_priority(), self.config.strict_priority)
    }

    async fn try_dequeue(&self) -> Option<(String, Task)> {
        for queue in self.select_queues() {
            if self.broker.is_paused(&queue).await.unwrap_or(false) {
                continue;
            }
            let lease_expiry = now_epoch() + self.config.lease_duration.as_secs() as i64;
            match self.broker.dequeue(&queue, lease_expiry).await {
                Ok(Some(task)) => return Some((queue, task)),
                Ok(None) => continue,
                Err(e) => {
                    (self.policy.health_check)(&e.to_string());
                    continue;
                }
            }
        }
        None
    }

    async fn run_one(self: Arc<Self>, queue: String, task: Task, permit: tokio::sync::OwnedSemaphorePermit, shutdown: CancellationToken) {
        let task_id = task.id.clone();
        let Some(handler) = self.handlers.resolve(&task.task_type) else {
            warn!(task_id = %task_id, task_type = %task.task_type, "no handler registered, archiving");
            if let Err(e) = self
                .broker
                .archive(&task, "no handler registered", self.config.archive_capacity)
                .await
            {
                error!(task_id = %task_id, error = %e, "archive for unregistered type failed");
            }
            drop(permit);
            return;
        };

        let cancel = CancellationToken::new();
        let now = now_epoch();
        let deadline = task.effective_deadline(now);

        self.active
            .insert(
                task_id.clone(),
                ActiveTaskHandle {
                    queue: queue.clone(),
                    task_type: task.task_type.clone(),
                    started_at: now,
                    cancel: cancel.clone(),
                },
            )
            .await;

        let ctx = TaskContext {
            id: task_id.clone(),
            task_type: task.task_type.clone(),
            queue: queue.clone(),
            retried: task.retried,
            max_retry: task.max_retry,
            deadline,
            cancel: cancel.clone(),
        };

        let watcher_cancel = cancel.clone();
        let watcher_shutdown = shutdown.clone();
        let deadline_sleep = deadline.map(|epoch| {
            let secs = (epoch - now_epoch()).max(0) as u64;
            Duration::from_secs(secs)
        });
        let watcher = tokio::spawn(async move {
            match deadline_sleep {
                Some(dur) => {
                    tokio::select! {
                        _ = tokio::time::sleep(dur) => {}
                        _ = watcher_shutdown.cancelled() => {}
                    }
                }
                None => watcher_shutdown.cancelled().await,
            }
            watcher_cancel.cancel();
        });

        let payload = task.payload.clone();
        let handler_task = tokio::spawn(async move { handler.run(&ctx, &payload).await });

        let outcome = handler_task.await;
        watcher.abort();
        self.active.remove(&task_id).await;

        let deadline_exceeded = deadline.map(|d| now_epoch() >= d).unwrap_or(false);

        match outcome {
            Ok(Ok(result)) => self.settle_done(task, result).await,
            Ok(Err(err)) => self.settle_failure(task, err.to_string(), deadline_exceeded).await,
            Err(join_err) => {
                let msg = if join_err.is_panic() {
                    "panic".to_string()
                } else {
                    join_err.to_string()
                };
                self.settle_failure(task, msg, deadline_exceeded).await;
            }
        }

        drop(permit);
    }

    async fn settle_done(&self, mut task: Task, result: Option<Vec<u8>>) {
        task.result = result;
        match self.broker.done(&task).await {
            Ok(()) => info!(task_id = %task.id, "task done"),
            Err(e) if e.is_transient() => {
                warn!(task_id = %task.id, error = %e, "done settle transient failure, routing to syncer");
                self.syncer.enqueue(SettleOp::Done(task));
            }
            Err(e) => error!(task_id = %task.id, error = %e, "settle done failed"),
        }
    }

    async fn settle_failure(&self, task: Task, err: String, deadline_exceeded: bool) {
        let err_msg = if deadline_exceeded {
            "deadline exceeded".to_string()
        } else {
            err
        };
        // A deadline-exceeded handler error is routed through the same
        // skip_retry/max_retry policy decision as any other handler error
        // (spec.md §7: "archive or retry per policy"), not forced to
        // archive unconditionally — that forced-archive behavior belongs
        // only to the recoverer's own deadline handling (spec.md §4.4),
        // which targets tasks no live worker is still holding a lease on.
        let should_archive = (self.policy.skip_retry)(&err_msg) || task.retried >= task.max_retry;

        if should_archive {
            let capacity = self.config.archive_capacity;
            match self.broker.archive(&task, &err_msg, capacity).await {
                Ok(()) => warn!(task_id = %task.id, error = %err_msg, "task archived"),
                Err(e) if e.is_transient() => {
                    self.syncer.enqueue(SettleOp::Archive {
                        task,
                        err: err_msg,
                        capacity,
                    });
                }
                Err(e) => error!(task_id = %task.id, error = %e, "settle archive failed"),
            }
        } else {
            let delay = (self.policy.retry_delay)(task.retried + 1, &err_msg);
            let retry_at = now_epoch() + delay.as_secs() as i64;
            match self.broker.retry(&task, retry_at, &err_msg).await {
                Ok(()) => debug!(task_id = %task.id, error = %err_msg, retry_at, "task scheduled for retry"),
                Err(e) if e.is_transient() => {
                    self.syncer.enqueue(SettleOp::Retry {
                        task,
                        retry_at,
                        err: err_msg,
                    });
                }
                Err(e) => error!(task_id = %task.id, error = %e, "settle retry failed"),
            }
        }
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("processor semaphore never closes")
                }
            };

            match self.try_dequeue().await {
                Some((queue, task)) => {
                    let this = Arc::clone(&self);
                    let worker_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        this.run_one(queue, task, permit, worker_shutdown).await;
                    });
                }
                None => {
                    drop(permit);
                    let backoff = jittered(self.config.idle_backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        // Drain in-flight workers: every permit returning to the semaphore
        // means its worker finished settling.
        let total = self.config.concurrency.max(1) as u32;
        let drain = tokio::time::timeout(self.config.shutdown_timeout, semaphore.acquire_many(total));
        if drain.await.is_err() {
            warn!("processor shutdown_timeout elapsed with workers still in flight");
        }

        Ok(())
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::random::<u64>() % 100;
    base + Duration::from_millis(jitter_ms)
}

/// Pure queue-ordering logic, factored out of [`Processor::select_queues`]
/// so it can be unit tested without a live broker.
fn order_queues(ordered: Vec<(String, u32)>, strict_priority: bool) -> Vec<String> {
    if ordered.is_empty() {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();

    if strict_priority {
        let mut ordered = ordered;
        let mut result = Vec::with_capacity(ordered.len());
        let mut i = 0;
        while i < ordered.len() {
            let weight = ordered[i].1;
            let mut j = i;
            while j < ordered.len() && ordered[j].1 == weight {
                j += 1;
            }
            ordered[i..j].shuffle(&mut rng);
            result.extend(ordered[i..j].iter().map(|(q, _)| q.clone()));
            i = j;
        }
        result
    } else {
        let mut remaining = ordered;
        let mut result = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let weights: Vec<u32> = remaining.iter().map(|(_, w)| (*w).max(1)).collect();
            match WeightedIndex::new(&weights) {
                Ok(dist) => {
                    let idx = dist.sample(&mut rng);
                    result.push(remaining.remove(idx).0);
                }
                Err(_) => {
                    remaining.shuffle(&mut rng);
                    result.extend(remaining.drain(..).map(|(q, _)| q));
                }
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl Service for Processor {
    fn name(&self) -> &'static str {
        "processor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let this = Arc::new(*self);
        this.run_loop(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_priority_orders_tiers_and_includes_every_queue() {
        let ordered = vec![
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 3),
            ("background".to_string(), 1),
        ];
        let result = order_queues(ordered, true);
        assert_eq!(result.len(), 4);
        assert_eq!(result[0], "critical");
        assert_eq!(result[3], "background");
        let mid: std::collections::HashSet<_> = result[1..3].iter().cloned().collect();
        assert_eq!(
            mid,
            ["default".to_string(), "low".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn weighted_order_includes_every_queue_exactly_once() {
        let ordered = vec![
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ];
        let result = order_queues(ordered, false);
        let mut sorted = result.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["critical".to_string(), "default".to_string(), "low".to_string()]);
    }

    #[test]
    fn empty_queue_set_selects_nothing() {
        assert!(order_queues(Vec::new(), true).is_empty());
        assert!(order_queues(Vec::new(), false).is_empty());
    }
}
