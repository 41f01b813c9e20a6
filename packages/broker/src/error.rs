//! Structured broker errors.
//!
//! Every atomic script returns a status code; [`BrokerError`] is what the
//! façade translates those codes into. Kept pattern-matchable rather than
//! `anyhow::Error` so callers (processor, recoverer, syncer) can decide retry
//! vs. drop vs. surface-to-client policy without string matching.

use thiserror::Error;

use crate::task::Epoch;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Enqueue attempted with an id that already exists.
    #[error("task id already exists: {id}")]
    TaskIdConflict { id: String },

    /// Enqueue attempted while a `unique_key` lock is held by another task.
    #[error("unique key held by another task: {key}")]
    DuplicateUnique { key: String },

    /// Settle or cancel targeted an id with no task record.
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("queue not empty: {queue}")]
    QueueNotEmpty { queue: String },

    /// Settle arrived for a task whose lease is no longer owned by the
    /// caller (score mismatch or absent). The caller should drop the settle;
    /// the recoverer will eventually requeue or archive the task.
    #[error("lease no longer owned for task {id} (expiry was {expected})")]
    LeaseExpired { id: String, expected: Epoch },

    /// No pending task available in any of the scanned queues.
    #[error("no task found")]
    NoTaskFound,

    /// Transient failure reaching the store; callers route these through the
    /// syncer rather than giving up.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    /// Task payload failed to encode or decode.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// A script returned a status this façade does not recognize.
    #[error("unexpected script response: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Transient errors are the ones worth retrying through the syncer;
    /// everything else is a permanent rejection that should be surfaced
    /// to the caller (or, for background loops, logged and skipped).
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::StoreUnavailable(_))
    }
}
