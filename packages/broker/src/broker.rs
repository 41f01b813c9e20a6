//! Typed façade over the script layer: key naming and encoding live here so
//! every caller (client, processor, background loops) goes through the same
//! path to the store.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::BrokerError;
use crate::keys;
use crate::script::{
    AddToGroupScript, AggregationCheckScript, ArchiveScript, CommitAggregationScript,
    DeleteExpiredCompletedScript, DequeueScript, Dequeued, DoneScript, EnqueueScheduledScript,
    EnqueueScript, ExtendLeaseScript, ForwardScript, GroupPolicy, ListLeaseExpiredScript,
    RequeueScript, RetryScript, TrimArchivedScript,
};
use crate::task::{now_epoch, Epoch, Task};

/// Everything needed to reach one Redis deployment. Cheap to clone: the
/// underlying `ConnectionManager` multiplexes over a single connection and
/// reconnects transparently.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    client: redis::Client,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::StoreUnavailable)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, client })
    }

    pub fn from_parts(conn: ConnectionManager, client: redis::Client) -> Self {
        Self { conn, client }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn enqueue(&self, task: &Task) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let blob = task.encode()?;
        let pending_key = keys::pending(&task.queue);
        let task_key = keys::task(&task.queue, &task.id);
        let unique_key = match &task.unique_key {
            Some(k) => keys::unique(&task.queue, k),
            None => String::new(),
        };

        EnqueueScript
            .run(
                &mut conn,
                &pending_key,
                &task_key,
                &unique_key,
                &task.id,
                &blob,
                task.unique_key.as_ref().map(|_| task.unique_ttl.unwrap_or(0)),
            )
            .await
    }

    pub async fn enqueue_scheduled(&self, task: &Task, process_at: Epoch) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let blob = task.encode()?;
        let scheduled_key = keys::scheduled(&task.queue);
        let task_key = keys::task(&task.queue, &task.id);
        let unique_key = match &task.unique_key {
            Some(k) => keys::unique(&task.queue, k),
            None => String::new(),
        };

        EnqueueScheduledScript
            .run(
                &mut conn,
                &scheduled_key,
                &task_key,
                &unique_key,
                &task.id,
                &blob,
                process_at,
                task.unique_key.as_ref().map(|_| task.unique_ttl.unwrap_or(0)),
            )
            .await
    }

    /// Try to pop one task from `queue`. Returns `Ok(None)` when the queue is
    /// paused or empty (the `NoTaskFound` case from the script contract).
    pub async fn dequeue(&self, queue: &str, lease_expiry: Epoch) -> Result<Option<Task>, BrokerError> {
        let mut conn = self.conn();
        let pending_key = keys::pending(queue);
        let active_key = keys::active(queue);
        let lease_key = keys::lease(queue);
        let paused_key = keys::paused(queue);

        let popped: Option<Dequeued> = DequeueScript
            .run(
                &mut conn,
                &pending_key,
                &active_key,
                &lease_key,
                &paused_key,
                queue,
                lease_expiry,
            )
            .await?;

        match popped {
            Some(Dequeued { blob, .. }) => Ok(Some(Task::decode(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn done(&self, task: &Task) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let active_key = keys::active(&task.queue);
        let lease_key = keys::lease(&task.queue);
        let completed_key = keys::completed(&task.queue);
        let task_key = keys::task(&task.queue, &task.id);
        let unique_key = match &task.unique_key {
            Some(k) => keys::unique(&task.queue, k),
            None => String::new(),
        };

        let retain = if task.retention > 0 {
            let mut done_task = task.clone();
            done_task.completed_at = now_epoch();
            let score = done_task.completed_at + task.retention as Epoch;
            Some((score, done_task.encode()?))
        } else {
            None
        };
        let retain_ref = retain.as_ref().map(|(score, blob)| (*score, blob.as_slice()));

        DoneScript
            .run(
                &mut conn,
                &active_key,
                &lease_key,
                &completed_key,
                &task_key,
                &unique_key,
                &task.id,
                retain_ref,
                task.unique_key.is_some(),
                now_epoch(),
            )
            .await
    }

    pub async fn retry(&self, task: &Task, retry_at: Epoch, err: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let mut updated = task.clone();
        updated.retried += 1;
        updated.last_err = Some(err.to_string());
        updated.last_failed_at = now_epoch();
        updated.failed_at = updated.last_failed_at;
        let blob = updated.encode()?;

        RetryScript
            .run(
                &mut conn,
                &keys::active(&task.queue),
                &keys::lease(&task.queue),
                &keys::retry(&task.queue),
                &keys::task(&task.queue, &task.id),
                &task.id,
                retry_at,
                &blob,
                now_epoch(),
            )
            .await
    }

    /// Archive a task as part of the normal settle path. Fails with
    /// `LeaseExpired` if the caller's lease has already passed, even if the
    /// recoverer has not yet swept it — another server may already own it.
    pub async fn archive(&self, task: &Task, err: &str, capacity: u64) -> Result<(), BrokerError> {
        self.archive_inner(task, err, capacity, false).await
    }

    /// Archive a task the recoverer has identified as past both its lease
    /// and its effective deadline. Unlike [`RedisBroker::archive`], this
    /// does not require the lease to still be in the future — the
    /// recoverer only ever calls this for ids `ListLeaseExpired` already
    /// confirmed are expired, so bypassing that check here is what lets
    /// crash recovery actually complete.
    pub async fn archive_recovered(&self, task: &Task, err: &str, capacity: u64) -> Result<(), BrokerError> {
        self.archive_inner(task, err, capacity, true).await
    }

    async fn archive_inner(&self, task: &Task, err: &str, capacity: u64, force: bool) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let mut updated = task.clone();
        updated.last_err = Some(err.to_string());
        updated.last_failed_at = now_epoch();
        updated.failed_at = updated.last_failed_at;
        let blob = updated.encode()?;

        ArchiveScript
            .run(
                &mut conn,
                &keys::active(&task.queue),
                &keys::lease(&task.queue),
                &keys::archived(&task.queue),
                &keys::task(&task.queue, &task.id),
                &task.id,
                now_epoch(),
                &blob,
                capacity,
                &task.queue,
                now_epoch(),
                force,
            )
            .await
    }

    /// Promote due `scheduled`/`retry` entries for one queue to `pending`.
    pub async fn forward(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn();
        ForwardScript
            .run(
                &mut conn,
                &keys::scheduled(queue),
                &keys::retry(queue),
                &keys::pending(queue),
                now_epoch(),
            )
            .await
    }

    pub async fn extend_lease(
        &self,
        queue: &str,
        ids: &[String],
        new_expiry: Epoch,
    ) -> Result<u64, BrokerError> {
        let mut conn = self.conn();
        ExtendLeaseScript
            .run(&mut conn, &keys::lease(queue), new_expiry, ids)
            .await
    }

    pub async fn list_lease_expired(&self, queue: &str, cutoff: Epoch) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        ListLeaseExpiredScript
            .run(&mut conn, &keys::lease(queue), cutoff)
            .await
    }

    pub async fn requeue(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        RequeueScript
            .run(
                &mut conn,
                &keys::active(queue),
                &keys::lease(queue),
                &keys::pending(queue),
                id,
            )
            .await
    }

    pub async fn add_to_group(&self, task: &Task, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let blob = task.encode()?;
        let unique_key = match &task.unique_key {
            Some(k) => keys::unique(&task.queue, k),
            None => String::new(),
        };

        AddToGroupScript
            .run(
                &mut conn,
                &keys::group(&task.queue, group),
                &keys::groups_index(&task.queue),
                &keys::task(&task.queue, &task.id),
                &unique_key,
                &task.id,
                now_epoch(),
                group,
                &blob,
                task.unique_key.as_ref().map(|_| task.unique_ttl.unwrap_or(0)),
            )
            .await
    }

    pub async fn aggregation_check(
        &self,
        queue: &str,
        group: &str,
        policy: &GroupPolicy,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        AggregationCheckScript
            .run(&mut conn, &keys::group(queue, group), policy, now_epoch())
            .await
    }

    /// Fetch the raw blobs for a set of group members ahead of calling the
    /// user's aggregator function.
    pub async fn get_task_blobs(&self, queue: &str, ids: &[String]) -> Result<Vec<Option<Vec<u8>>>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let task_keys: Vec<String> = ids.iter().map(|id| keys::task(queue, id)).collect();
        let blobs: Vec<Option<Vec<u8>>> = conn.mget(task_keys).await?;
        Ok(blobs)
    }

    /// `members` are the tasks being folded into `new_task`; their unique
    /// locks (if any) are released as part of the same atomic commit, since
    /// a folded member no longer occupies the `aggregating` state that
    /// invariant 5 grants it the lock for.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit_aggregation(
        &self,
        queue: &str,
        group: &str,
        new_task: &Task,
        members: &[Task],
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let blob = new_task.encode()?;
        let member_keys: Vec<(String, String)> = members
            .iter()
            .map(|member| {
                let unique_key = match &member.unique_key {
                    Some(k) => keys::unique(queue, k),
                    None => String::new(),
                };
                (member.id.clone(), unique_key)
            })
            .collect();

        CommitAggregationScript
            .run(
                &mut conn,
                &keys::group(queue, group),
                &keys::groups_index(queue),
                &keys::pending(queue),
                &keys::task(queue, &new_task.id),
                group,
                queue,
                &new_task.id,
                &blob,
                &member_keys,
            )
            .await
    }

    pub async fn active_groups(&self, queue: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        let groups: Vec<String> = conn.smembers(keys::groups_index(queue)).await?;
        Ok(groups)
    }

    pub async fn delete_expired_completed(&self, queue: &str, batch_size: u64) -> Result<u64, BrokerError> {
        let mut conn = self.conn();
        DeleteExpiredCompletedScript
            .run(&mut conn, &keys::completed(queue), now_epoch(), queue, batch_size)
            .await
    }

    /// Evict `archived` entries beyond `capacity`, independent of the
    /// eviction `archive` already performs inline. The janitor calls this so
    /// a lowered `archive_capacity` is enforced retroactively.
    pub async fn trim_archived(&self, queue: &str, capacity: u64) -> Result<u64, BrokerError> {
        let mut conn = self.conn();
        TrimArchivedScript
            .run(&mut conn, &keys::archived(queue), capacity, queue)
            .await
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(keys::paused(queue)).await?;
        Ok(exists)
    }

    pub async fn pause(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.set(keys::paused(queue), 1).await?;
        Ok(())
    }

    pub async fn unpause(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.del(keys::paused(queue)).await?;
        Ok(())
    }

    /// Write a TTL-bearing roster record, used by the heartbeat loop for
    /// both server and worker identity keys.
    pub async fn write_roster_record(&self, key: &str, payload: &[u8], ttl: u64) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.set_ex(key, payload, ttl).await?;
        Ok(())
    }

    pub async fn delete_roster_record(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.del(key).await?;
        Ok(())
    }

    pub async fn publish_cancel(&self, task_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(keys::cancel_channel(), keys::cancel_message(task_id)).await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to the cancel channel.
    /// `ConnectionManager` multiplexes regular commands and cannot itself
    /// enter subscriber mode, so the subscriber loop needs its own socket.
    pub async fn cancel_subscription(&self) -> Result<redis::aio::PubSub, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(keys::cancel_channel()).await?;
        Ok(pubsub)
    }
}
