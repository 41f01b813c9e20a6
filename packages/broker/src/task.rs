//! Task record: the unit of work carried through the broker's state machine.
//!
//! A [`Task`] is opaque payload plus the metadata the script layer needs to
//! move it between queue states. Encoding is a deterministic binary format
//! (bincode) rather than protobuf framing, which this crate treats as an
//! external collaborator per the wire contract; any encoding that round-trips
//! every field exactly satisfies it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Epoch seconds. All scores written into Redis sorted sets are expressed in
/// this unit so that `ZRANGEBYSCORE`/`ZADD` comparisons stay simple integers.
pub type Epoch = i64;

pub fn now_epoch() -> Epoch {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as Epoch
}

/// Task metadata and payload, as stored under `t:<id>`.
///
/// Field set mirrors the wire contract in full: every field here must survive
/// an encode/decode round trip exactly, including zero-valued optionals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,

    pub max_retry: u32,
    pub retried: u32,

    /// Relative timeout in seconds; 0 means "use the default".
    pub timeout: u64,
    /// Absolute deadline, epoch seconds; 0 means "none".
    pub deadline: Epoch,

    pub unique_key: Option<String>,
    pub unique_ttl: Option<u64>,
    pub group_key: Option<String>,

    pub completed_at: Epoch,
    pub processed_at: Epoch,
    pub failed_at: Epoch,

    pub last_err: Option<String>,
    pub last_failed_at: Epoch,

    pub pending_since: Epoch,

    /// How long (seconds) a completed task is retained before the janitor
    /// reaps it. 0 means the task is deleted immediately on completion.
    pub retention: u64,

    pub result: Option<Vec<u8>>,
}

impl Task {
    /// Build a new task ready for enqueue. `id` is caller-supplied (typically
    /// a UUIDv4/v7) so that enqueue-side deduplication by id is possible.
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        payload: Vec<u8>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            queue: queue.into(),
            max_retry: 25,
            retried: 0,
            timeout: 0,
            deadline: 0,
            unique_key: None,
            unique_ttl: None,
            group_key: None,
            completed_at: 0,
            processed_at: 0,
            failed_at: 0,
            last_err: None,
            last_failed_at: 0,
            pending_since: now_epoch(),
            retention: 0,
            result: None,
        }
    }

    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Effective deadline: `timeout` and `deadline` compose as "earliest of
    /// the two that is actually set", matching the processor's
    /// `min(task.deadline, now + task.timeout)` rule.
    pub fn effective_deadline(&self, now: Epoch) -> Option<Epoch> {
        let from_timeout = if self.timeout > 0 {
            Some(now + self.timeout as Epoch)
        } else {
            None
        };
        let from_deadline = if self.deadline > 0 {
            Some(self.deadline)
        } else {
            None
        };
        match (from_timeout, from_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field() {
        let mut task = Task::new("A", "email:send", b"hello".to_vec(), "default");
        task.unique_key = Some("k".into());
        task.unique_ttl = Some(60);
        task.group_key = Some("g".into());
        task.max_retry = 5;
        task.retried = 2;
        task.timeout = 30;
        task.deadline = 12345;
        task.completed_at = 1;
        task.processed_at = 2;
        task.failed_at = 3;
        task.last_err = Some("boom".into());
        task.last_failed_at = 4;
        task.retention = 86400;
        task.result = Some(b"ok".to_vec());

        let encoded = task.encode().unwrap();
        let decoded = Task::decode(&encoded).unwrap();
        assert_eq!(task, decoded);
    }

    #[test]
    fn effective_deadline_prefers_earlier() {
        let mut task = Task::new("A", "t", vec![], "default");
        task.timeout = 10;
        task.deadline = 1000;
        assert_eq!(task.effective_deadline(990), Some(1000));
        task.deadline = 2000;
        assert_eq!(task.effective_deadline(990), Some(1000));
    }

    #[test]
    fn effective_deadline_none_when_unset() {
        let task = Task::new("A", "t", vec![], "default");
        assert_eq!(task.effective_deadline(now_epoch()), None);
    }
}
