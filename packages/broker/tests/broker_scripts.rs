//! Integration tests exercising the atomic script layer against a real
//! Redis instance. Each test uses its own queue name since the container is
//! shared across the whole binary.

mod common;

use broker::{now_epoch, BrokerError, Client, Task, TaskOptions};
use common::BrokerHarness;
use test_context::test_context;

fn queue_name(tag: &str) -> String {
    format!("test-{tag}-{}", uuid::Uuid::new_v4())
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn enqueue_dequeue_done_round_trip(ctx: &mut BrokerHarness) {
    let queue = queue_name("round-trip");
    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());

    let id = client
        .enqueue("email:welcome", b"hello".to_vec(), TaskOptions::new())
        .await
        .expect("enqueue failed");

    let task = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .expect("dequeue failed")
        .expect("expected a task");
    assert_eq!(task.id, id);
    assert_eq!(task.payload, b"hello");

    // Nothing else pending.
    assert!(ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .is_none());

    ctx.broker.done(&task).await.expect("done failed");
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn duplicate_task_id_is_rejected(ctx: &mut BrokerHarness) {
    let queue = queue_name("dup-id");
    let task = Task::new("fixed-id".to_string(), "email:welcome", b"x".to_vec(), queue);

    ctx.broker.enqueue(&task).await.expect("first enqueue");
    let err = ctx
        .broker
        .enqueue(&task)
        .await
        .expect_err("second enqueue with same id should fail");
    assert!(matches!(err, BrokerError::TaskIdConflict { .. }));
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn unique_key_blocks_concurrent_enqueue(ctx: &mut BrokerHarness) {
    let queue = queue_name("unique");
    let client = Client::new(ctx.broker.clone()).with_default_queue(queue.clone());

    let opts = TaskOptions::new().unique("signup:42".to_string(), std::time::Duration::from_secs(60));
    client
        .enqueue("email:welcome", b"a".to_vec(), opts.clone())
        .await
        .expect("first enqueue should succeed");

    let err = client
        .enqueue("email:welcome", b"b".to_vec(), opts)
        .await
        .expect_err("second enqueue holding the same unique key should fail");
    assert!(matches!(err, BrokerError::DuplicateUnique { .. }));
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn done_after_lease_expiry_is_rejected(ctx: &mut BrokerHarness) {
    let queue = queue_name("lease-expired");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    ctx.broker.enqueue(&task).await.unwrap();

    // Lease already in the past.
    let dequeued = ctx
        .broker
        .dequeue(&queue, now_epoch() - 1)
        .await
        .unwrap()
        .unwrap();

    let err = ctx
        .broker
        .done(&dequeued)
        .await
        .expect_err("done against an expired lease should fail");
    assert!(matches!(err, BrokerError::LeaseExpired { .. }));
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn retry_reschedules_and_forward_promotes_it(ctx: &mut BrokerHarness) {
    let queue = queue_name("retry-forward");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    ctx.broker.enqueue(&task).await.unwrap();

    let dequeued = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dequeued.retried, 0);

    ctx.broker
        .retry(&dequeued, now_epoch() - 1, "boom")
        .await
        .expect("retry failed");

    // Not pending until forwarded.
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());

    let promoted = ctx.broker.forward(&queue).await.expect("forward failed");
    assert_eq!(promoted, 1);

    let retried_task = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .expect("task should be pending after forward");
    assert_eq!(retried_task.retried, 1);
    assert_eq!(retried_task.last_err.as_deref(), Some("boom"));
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn trim_archived_enforces_a_lowered_capacity(ctx: &mut BrokerHarness) {
    let queue = queue_name("archive-capacity");

    // Archive with capacity 0 (unlimited) so all three land in `archived`
    // uncontested, simulating an operator lowering `archive_capacity` after
    // the fact rather than it being enforced at write time.
    for i in 0..3 {
        let task = Task::new(format!("t{i}"), "email:welcome", b"x".to_vec(), queue.clone());
        ctx.broker.enqueue(&task).await.unwrap();
        let dequeued = ctx
            .broker
            .dequeue(&queue, now_epoch() + 30)
            .await
            .unwrap()
            .unwrap();
        ctx.broker.archive(&dequeued, "permanent failure", 0).await.unwrap();
    }

    let evicted = ctx.broker.trim_archived(&queue, 2).await.unwrap();
    assert_eq!(evicted, 1);

    // Idempotent once at capacity.
    let evicted_again = ctx.broker.trim_archived(&queue, 2).await.unwrap();
    assert_eq!(evicted_again, 0);
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn lease_expired_tasks_are_requeued_by_recoverer_path(ctx: &mut BrokerHarness) {
    let queue = queue_name("recoverer");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    ctx.broker.enqueue(&task).await.unwrap();

    ctx.broker
        .dequeue(&queue, now_epoch() - 1)
        .await
        .unwrap()
        .unwrap();

    let expired = ctx
        .broker
        .list_lease_expired(&queue, now_epoch())
        .await
        .expect("list_lease_expired failed");
    assert_eq!(expired, vec!["t1".to_string()]);

    ctx.broker.requeue(&queue, "t1").await.expect("requeue failed");

    let requeued = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .expect("requeued task should be pending again");
    assert_eq!(requeued.id, "t1");
    assert_eq!(requeued.retried, 0, "requeue must not touch retried count");
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn scheduled_task_is_not_promoted_before_its_time(ctx: &mut BrokerHarness) {
    let queue = queue_name("scheduled");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());

    ctx.broker
        .enqueue_scheduled(&task, now_epoch() + 3600)
        .await
        .expect("enqueue_scheduled failed");

    // Not visible to dequeue, and forwarding now doesn't promote it early.
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());
    assert_eq!(ctx.broker.forward(&queue).await.unwrap(), 0);
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());

    // A second enqueue_scheduled for a due time does get promoted by forward.
    let due = Task::new("t2".to_string(), "email:welcome", b"y".to_vec(), queue.clone());
    ctx.broker
        .enqueue_scheduled(&due, now_epoch() - 1)
        .await
        .expect("enqueue_scheduled failed");
    assert_eq!(ctx.broker.forward(&queue).await.unwrap(), 1);
    let promoted = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .expect("due task should be pending after forward");
    assert_eq!(promoted.id, "t2");
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn concurrent_dequeues_never_return_the_same_id(ctx: &mut BrokerHarness) {
    let queue = queue_name("concurrent-dequeue");
    for i in 0..20 {
        let task = Task::new(format!("t{i}"), "email:welcome", b"x".to_vec(), queue.clone());
        ctx.broker.enqueue(&task).await.unwrap();
    }

    // Simulate several processors racing the same queue: fire off more
    // dequeue attempts than there are tasks and assert every returned id is
    // distinct (the `pending` LPOP + `active` RPUSH pair in DequeueScript is
    // atomic, so no two callers can observe the same head element).
    let mut handles = Vec::new();
    for _ in 0..30 {
        let broker = ctx.broker.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            broker.dequeue(&queue, now_epoch() + 30).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut dequeued_count = 0;
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            dequeued_count += 1;
            assert!(seen.insert(task.id), "duplicate dequeue of the same task id");
        }
    }
    assert_eq!(dequeued_count, 20);
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn requeue_is_a_no_op_once_the_id_already_left_active(ctx: &mut BrokerHarness) {
    let queue = queue_name("requeue-race");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    ctx.broker.enqueue(&task).await.unwrap();
    ctx.broker.dequeue(&queue, now_epoch() - 1).await.unwrap().unwrap();

    // Two recoverers observe the same expired lease and both call requeue.
    // The first actually moves it back to pending; the second must be a
    // no-op rather than pushing a second copy of "t1" onto pending.
    ctx.broker.requeue(&queue, "t1").await.expect("first requeue failed");
    ctx.broker.requeue(&queue, "t1").await.expect("second requeue failed");

    let first = ctx
        .broker
        .dequeue(&queue, now_epoch() + 30)
        .await
        .unwrap()
        .expect("t1 should be pending exactly once");
    assert_eq!(first.id, "t1");

    // No duplicate sitting behind it.
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn group_member_unique_key_blocks_duplicates_and_releases_on_commit(ctx: &mut BrokerHarness) {
    use broker::script::GroupPolicy;

    let queue = queue_name("group-unique");
    let mut task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    task.group_key = Some("g".to_string());
    task.unique_key = Some("signup:42".to_string());
    task.unique_ttl = Some(60);

    ctx.broker.add_to_group(&task, "g").await.expect("add_to_group failed");

    // While t1 sits in the aggregating state, its unique key still blocks a
    // concurrent duplicate, whether the duplicate also goes through the
    // group path or the plain enqueue path.
    let mut dup = Task::new("t2".to_string(), "email:welcome", b"y".to_vec(), queue.clone());
    dup.group_key = Some("g".to_string());
    dup.unique_key = Some("signup:42".to_string());
    dup.unique_ttl = Some(60);
    let err = ctx
        .broker
        .add_to_group(&dup, "g")
        .await
        .expect_err("duplicate unique key under the group path should fail");
    assert!(matches!(err, BrokerError::DuplicateUnique { .. }));

    let mut dup_plain = Task::new("t3".to_string(), "email:welcome", b"z".to_vec(), queue.clone());
    dup_plain.unique_key = Some("signup:42".to_string());
    dup_plain.unique_ttl = Some(60);
    let err = ctx
        .broker
        .enqueue(&dup_plain)
        .await
        .expect_err("duplicate unique key via plain enqueue should also fail");
    assert!(matches!(err, BrokerError::DuplicateUnique { .. }));

    // Force the group to commit by fetching the member and building an
    // aggregated replacement, mirroring what the aggregator's tick does
    // once AggregationCheck returns members.
    let policy = GroupPolicy {
        max_size: 1,
        max_delay: 0,
        grace_period: 0,
    };
    let members = ctx
        .broker
        .aggregation_check(&queue, "g", &policy)
        .await
        .expect("aggregation_check failed");
    assert_eq!(members, vec!["t1".to_string()]);

    let blobs = ctx.broker.get_task_blobs(&queue, &members).await.unwrap();
    let member_tasks: Vec<Task> = blobs.into_iter().flatten().map(|b| Task::decode(&b).unwrap()).collect();

    let aggregated = Task::new("agg-1".to_string(), "email:welcome", b"combined".to_vec(), queue.clone());
    ctx.broker
        .commit_aggregation(&queue, "g", &aggregated, &member_tasks)
        .await
        .expect("commit_aggregation failed");

    // The unique lock is released now that t1 left the aggregating state,
    // so a fresh enqueue with the same key succeeds.
    let mut reuse = Task::new("t4".to_string(), "email:welcome", b"w".to_vec(), queue.clone());
    reuse.unique_key = Some("signup:42".to_string());
    reuse.unique_ttl = Some(60);
    ctx.broker
        .enqueue(&reuse)
        .await
        .expect("unique key should be free again after commit_aggregation");
}

#[test_context(BrokerHarness)]
#[tokio::test]
async fn paused_queue_is_not_dequeued(ctx: &mut BrokerHarness) {
    let queue = queue_name("paused");
    let task = Task::new("t1".to_string(), "email:welcome", b"x".to_vec(), queue.clone());
    ctx.broker.enqueue(&task).await.unwrap();

    ctx.broker.pause(&queue).await.unwrap();
    assert!(ctx.broker.is_paused(&queue).await.unwrap());
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_none());

    ctx.broker.unpause(&queue).await.unwrap();
    assert!(!ctx.broker.is_paused(&queue).await.unwrap());
    assert!(ctx.broker.dequeue(&queue, now_epoch() + 30).await.unwrap().is_some());
}
