//! End-to-end tests driving the real background services (processor,
//! scheduler, recoverer, aggregator) against a live Redis container, per
//! the scenarios in spec.md §8. Each test uses its own queue name since the
//! container is shared across the whole binary.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker::{now_epoch, Client, Task, TaskOptions};
use common::{wait_until, ServerHarness};
use server_core::config::GroupPolicyConfig;
use server_core::registry::{Handler, TaskContext};
use server_core::{ActiveTasks, Config, HandlerRegistry, Policy, Service, Syncer};
use test_context::test_context;
use tokio_util::sync::CancellationToken;

fn queue_name(tag: &str) -> String {
    format!("test-{tag}-{}", uuid::Uuid::new_v4())
}

fn base_config(queue: &str) -> Config {
    let mut config = Config::default();
    config.queues = HashMap::from([(queue.to_string(), 1)]);
    config.concurrency = 1;
    config.idle_backoff = Duration::from_millis(20);
    config.lease_duration = Duration::from_secs(30);
    config.shutdown_timeout = Duration::from_secs(2);
    config.archive_capacity = 100;
    config
}

fn immediate_retry_policy() -> Policy {
    Policy {
        retry_delay: Arc::new(|_n, _err| Duration::ZERO),
        skip_retry: Arc::new(|_err| false),
        health_check: Arc::new(|_err| {}),
        group_aggregator: None,
    }
}

/// Runs a boxed `Service` to completion, timing out rather than hanging the
/// test suite if the service never observes its shutdown signal.
fn spawn_service(service: impl Service + 'static, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let boxed: Box<dyn Service> = Box::new(service);
        let _ = tokio::time::timeout(Duration::from_secs(5), boxed.run(shutdown)).await;
    })
}

struct FailHandler {
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Handler for FailHandler {
    async fn run(&self, _ctx: &TaskContext, _payload: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("boom"))
    }
}

/// S1: a handler that always fails drives a task through every retry and is
/// archived with "boom" once `max_retry` is exhausted; the scheduler's
/// `forward` tick is what promotes the retry-zset entry back to `pending`
/// between attempts.
#[test_context(ServerHarness)]
#[tokio::test]
async fn retry_then_archive_after_max_retries(ctx: &mut ServerHarness) {
    let queue = queue_name("retry-archive");
    let config = base_config(&queue);
    let policy = immediate_retry_policy();

    let attempts = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "test:fail",
        Arc::new(FailHandler {
            attempts: attempts.clone(),
        }),
    );

    let active = ActiveTasks::new();
    let (syncer, _syncer_rx) = Syncer::new();

    let processor = server_core::processor::Processor::new(
        ctx.broker.clone(),
        config.clone(),
        policy,
        Arc::new(handlers),
        active.clone(),
        syncer,
    );
    let scheduler = server_core::scheduler::Scheduler::new(
        ctx.broker.clone(),
        vec![queue.clone()],
        Duration::from_millis(30),
    );

    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());
    let id = client
        .enqueue("test:fail", b"payload".to_vec(), TaskOptions::new().max_retry(2))
        .await
        .expect("enqueue failed");

    let shutdown = CancellationToken::new();
    let processor_handle = spawn_service(processor, shutdown.clone());
    let scheduler_handle = spawn_service(scheduler, shutdown.clone());

    let settled = wait_until(Duration::from_secs(5), || {
        let broker = ctx.broker.clone();
        let queue = queue.clone();
        let id = id.clone();
        async move {
            match broker.get_task_blobs(&queue, &[id]).await {
                Ok(blobs) => blobs
                    .into_iter()
                    .flatten()
                    .filter_map(|blob| Task::decode(&blob).ok())
                    .any(|task| task.last_err.is_some() && task.retried >= task.max_retry),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(settled, "task was not archived within the deadline");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(3), processor_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), scheduler_handle).await;

    // 1 initial attempt + 2 retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(active.is_empty().await);

    let blobs = ctx.broker.get_task_blobs(&queue, &[id.clone()]).await.unwrap();
    let task = Task::decode(blobs[0].as_ref().unwrap()).unwrap();
    assert_eq!(task.retried, 2);
    assert_eq!(task.last_err.as_deref(), Some("boom"));
    // Archived, not pending: nothing left to dequeue.
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());
}

/// S4 (crash, no deadline yet): a worker that vanished after dequeue leaves
/// its lease to expire; the recoverer sweeps it back to `pending` with
/// `retried` untouched.
#[test_context(ServerHarness)]
#[tokio::test]
async fn recoverer_requeues_after_worker_crash(ctx: &mut ServerHarness) {
    let queue = queue_name("recover-requeue");
    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());
    let id = client
        .enqueue("test:echo", b"x".to_vec(), TaskOptions::new().max_retry(3))
        .await
        .expect("enqueue failed");

    // Simulate a crashed worker: dequeue with a lease that is already past.
    let task = ctx
        .broker
        .dequeue(&queue, now_epoch() - 1)
        .await
        .unwrap()
        .expect("expected a task");
    assert_eq!(task.id, id);

    let recoverer = server_core::recoverer::Recoverer::new(
        ctx.broker.clone(),
        vec![queue.clone()],
        Duration::from_millis(30),
        100,
    );
    let shutdown = CancellationToken::new();
    let handle = spawn_service(recoverer, shutdown.clone());

    let recovered = wait_until(Duration::from_secs(5), || {
        let broker = ctx.broker.clone();
        let queue = queue.clone();
        async move { broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_some() }
    })
    .await;
    assert!(recovered, "task was not requeued by the recoverer");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;

    let blobs = ctx.broker.get_task_blobs(&queue, &[id]).await.unwrap();
    let task = Task::decode(blobs[0].as_ref().unwrap()).unwrap();
    assert_eq!(task.retried, 0, "recovery must not consume a retry");
}

/// S4 (crash, deadline already passed): the recoverer archives instead of
/// requeueing once the task's effective deadline has elapsed, using the
/// force path that bypasses the normal lease-ownership check.
#[test_context(ServerHarness)]
#[tokio::test]
async fn recoverer_archives_when_deadline_already_exceeded(ctx: &mut ServerHarness) {
    let queue = queue_name("recover-archive");
    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());
    let id = client
        .enqueue(
            "test:echo",
            b"x".to_vec(),
            TaskOptions::new().deadline(now_epoch() - 1),
        )
        .await
        .expect("enqueue failed");

    let task = ctx
        .broker
        .dequeue(&queue, now_epoch() - 1)
        .await
        .unwrap()
        .expect("expected a task");
    assert_eq!(task.id, id);

    let recoverer = server_core::recoverer::Recoverer::new(
        ctx.broker.clone(),
        vec![queue.clone()],
        Duration::from_millis(30),
        100,
    );
    let shutdown = CancellationToken::new();
    let handle = spawn_service(recoverer, shutdown.clone());

    let archived = wait_until(Duration::from_secs(5), || {
        let broker = ctx.broker.clone();
        let queue = queue.clone();
        let id = id.clone();
        async move {
            match broker.get_task_blobs(&queue, &[id]).await {
                Ok(blobs) => blobs
                    .into_iter()
                    .flatten()
                    .filter_map(|blob| Task::decode(&blob).ok())
                    .any(|task| task.last_err.as_deref() == Some("deadline exceeded")),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(archived, "task was not archived by the recoverer");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;

    // Archived, so it must not have been requeued to pending.
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());
}

/// S6: three tasks sharing a group key are folded into one combined task
/// once `max_size` is reached, and the originals are gone from the group
/// index afterward.
#[test_context(ServerHarness)]
#[tokio::test]
async fn aggregator_combines_group_members_into_one_task(ctx: &mut ServerHarness) {
    let queue = queue_name("aggregate");
    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());

    for payload in [&b"a"[..], &b"b"[..], &b"c"[..]] {
        client
            .enqueue("test:echo", payload.to_vec(), TaskOptions::new().group("g1"))
            .await
            .expect("enqueue into group failed");
    }

    let mut group_policies = HashMap::new();
    group_policies.insert(
        queue.clone(),
        GroupPolicyConfig {
            max_size: 3,
            max_delay: Duration::ZERO,
            grace_period: Duration::from_secs(9_999),
        },
    );

    let aggregator_fn: server_core::config::GroupAggregatorFn = Arc::new(|tasks| {
        let mut combined = tasks[0].clone();
        let mut payload = Vec::new();
        for (i, task) in tasks.iter().enumerate() {
            if i > 0 {
                payload.push(b'|');
            }
            payload.extend_from_slice(&task.payload);
        }
        combined.payload = payload;
        combined.id = Task::new_id();
        combined.group_key = None;
        combined
    });

    let aggregator = server_core::aggregator::Aggregator::new(
        ctx.broker.clone(),
        group_policies,
        Some(aggregator_fn),
        Duration::from_millis(30),
    );
    let shutdown = CancellationToken::new();
    let handle = spawn_service(aggregator, shutdown.clone());

    let combined = wait_until(Duration::from_secs(5), || {
        let broker = ctx.broker.clone();
        let queue = queue.clone();
        async move { broker.active_groups(&queue).await.unwrap().is_empty() }
    })
    .await;
    assert!(combined, "group was not committed by the aggregator");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;

    let task = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .expect("expected the combined task to be pending");

    let mut parts: Vec<&[u8]> = task.payload.split(|b| *b == b'|').collect();
    parts.sort();
    assert_eq!(parts, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
}
