//! Public producer-side API: encode a task and enqueue it.

use std::time::Duration;

use crate::broker::RedisBroker;
use crate::error::BrokerError;
use crate::task::{now_epoch, Epoch, Task};

/// Options accepted by [`Client::enqueue`]. Construct with `TaskOptions::new`
/// and chain setters; unset fields fall back to broker-wide defaults.
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    queue: Option<String>,
    id: Option<String>,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<Epoch>,
    process_at: Option<Epoch>,
    process_in: Option<Duration>,
    unique_key: Option<String>,
    unique_ttl: Option<Duration>,
    group: Option<String>,
    retention: Option<Duration>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline_epoch: Epoch) -> Self {
        self.deadline = Some(deadline_epoch);
        self
    }

    /// Schedule for a specific absolute time rather than running now.
    pub fn process_at(mut self, at_epoch: Epoch) -> Self {
        self.process_at = Some(at_epoch);
        self
    }

    /// Schedule for `delay` from now.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self
    }

    /// Reject concurrent enqueues sharing `key` while the lock is held, for
    /// `ttl`. Callers typically derive `key` from task type + a business
    /// identifier, not from the generated task id.
    pub fn unique(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.unique_key = Some(key.into());
        self.unique_ttl = Some(ttl);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// Producer handle. Cheap to clone (wraps a [`RedisBroker`]).
#[derive(Clone)]
pub struct Client {
    broker: RedisBroker,
    default_queue: String,
    default_max_retry: u32,
}

impl Client {
    pub fn new(broker: RedisBroker) -> Self {
        Self {
            broker,
            default_queue: "default".to_string(),
            default_max_retry: 25,
        }
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Enqueue a task of `task_type` carrying `payload`. Returns the task id
    /// (caller-chosen via `TaskOptions::id`, or a fresh UUIDv4).
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        payload: Vec<u8>,
        opts: TaskOptions,
    ) -> Result<String, BrokerError> {
        let id = opts.id.clone().unwrap_or_else(Task::new_id);
        let queue = opts.queue.clone().unwrap_or_else(|| self.default_queue.clone());

        let mut task = Task::new(id.clone(), task_type, payload, queue);
        task.max_retry = opts.max_retry.unwrap_or(self.default_max_retry);
        if let Some(timeout) = opts.timeout {
            task.timeout = timeout.as_secs();
        }
        if let Some(deadline) = opts.deadline {
            task.deadline = deadline;
        }
        if let Some(group) = &opts.group {
            task.group_key = Some(group.clone());
        }
        if let Some(retention) = opts.retention {
            task.retention = retention.as_secs();
        }
        if let Some(key) = opts.unique_key {
            task.unique_key = Some(key);
            task.unique_ttl = opts.unique_ttl.map(|ttl| ttl.as_secs());
        }

        if let Some(group) = task.group_key.clone() {
            self.broker.add_to_group(&task, &group).await?;
            return Ok(id);
        }

        let process_at = opts
            .process_at
            .or_else(|| opts.process_in.map(|delay| now_epoch() + delay.as_secs() as Epoch));

        match process_at {
            Some(at) if at > now_epoch() => {
                self.broker.enqueue_scheduled(&task, at).await?;
            }
            _ => {
                self.broker.enqueue(&task).await?;
            }
        }

        Ok(id)
    }

    pub fn broker(&self) -> &RedisBroker {
        &self.broker
    }
}
