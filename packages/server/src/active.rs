//! Registry of in-flight tasks shared between the processor, heartbeat, and
//! subscriber loops.
//!
//! The processor inserts an entry when a worker task starts and removes it
//! once the handler returns. The heartbeat loop reads it to extend leases
//! and to publish read-only worker snapshots; the subscriber triggers the
//! cancellation handle for a given id on receipt of a `cancel:<id>` pub/sub
//! message. No lock is ever held across a store call — only for the map
//! mutation itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ActiveTaskHandle {
    pub queue: String,
    pub task_type: String,
    pub started_at: i64,
    pub cancel: CancellationToken,
}

/// Read-only view of one in-flight task, for the heartbeat's roster record.
#[derive(Debug, Clone)]
pub struct ActiveTaskSnapshot {
    pub id: String,
    pub task_type: String,
    pub queue: String,
    pub started_at: i64,
}

#[derive(Clone, Default)]
pub struct ActiveTasks {
    inner: Arc<RwLock<HashMap<String, ActiveTaskHandle>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: String, handle: ActiveTaskHandle) {
        self.inner.write().await.insert(id, handle);
    }

    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids currently leased for `queue`, for the heartbeat's per-queue
    /// `ExtendLease` calls.
    pub async fn ids_for_queue(&self, queue: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, handle)| handle.queue == queue)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Snapshot every in-flight task, for the heartbeat's roster record.
    pub async fn snapshot(&self) -> Vec<ActiveTaskSnapshot> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, handle)| ActiveTaskSnapshot {
                id: id.clone(),
                task_type: handle.task_type.clone(),
                queue: handle.queue.clone(),
                started_at: handle.started_at,
            })
            .collect()
    }

    /// Signal cancellation for one task, if it is currently in flight here.
    /// Unknown ids are ignored, matching the subscriber's contract.
    pub async fn cancel(&self, id: &str) -> bool {
        if let Some(handle) = self.inner.read().await.get(id) {
            handle.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every in-flight task, used on server shutdown.
    pub async fn cancel_all(&self) {
        for handle in self.inner.read().await.values() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(queue: &str, cancel: CancellationToken) -> ActiveTaskHandle {
        ActiveTaskHandle {
            queue: queue.to_string(),
            task_type: "email:send".to_string(),
            started_at: 0,
            cancel,
        }
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_ignored() {
        let tasks = ActiveTasks::new();
        assert!(!tasks.cancel("missing").await);
    }

    #[tokio::test]
    async fn cancel_known_id_fires_token() {
        let tasks = ActiveTasks::new();
        let cancel = CancellationToken::new();
        tasks
            .insert("A".to_string(), handle("default", cancel.clone()))
            .await;

        assert!(tasks.cancel("A").await);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn ids_for_queue_filters_by_queue() {
        let tasks = ActiveTasks::new();
        tasks
            .insert("A".to_string(), handle("default", CancellationToken::new()))
            .await;
        tasks
            .insert("B".to_string(), handle("critical", CancellationToken::new()))
            .await;

        let ids = tasks.ids_for_queue("default").await;
        assert_eq!(ids, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_reports_every_in_flight_task() {
        let tasks = ActiveTasks::new();
        tasks
            .insert("A".to_string(), handle("default", CancellationToken::new()))
            .await;

        let snapshot = tasks.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "A");
        assert_eq!(snapshot[0].task_type, "email:send");
    }
}
