//! The atomic script layer.
//!
//! One file per effect, each holding the Lua source as a `const`, a
//! `lazy_static` compiled `redis::Script`, and a thin wrapper type with a
//! `run` method that supplies `KEYS`/`ARGV` and parses the reply. This
//! mirrors how the queue scripts are organized one-operation-per-file so each
//! script's KEYS/ARGV contract is documented right next to its Lua source.
//!
//! Every script here only ever touches keys carrying the same `{q:<queue>}`
//! hash tag, so each is safe to `EVAL` against a single Redis Cluster shard.

mod add_to_group;
mod aggregation_check;
mod archive;
mod commit_aggregation;
mod delete_expired_completed;
mod dequeue;
mod done;
mod enqueue;
mod enqueue_scheduled;
mod extend_lease;
mod forward;
mod list_lease_expired;
mod requeue;
mod retry;
mod trim_archived;

pub use add_to_group::AddToGroupScript;
pub use aggregation_check::{AggregationCheckScript, GroupPolicy};
pub use archive::ArchiveScript;
pub use commit_aggregation::CommitAggregationScript;
pub use delete_expired_completed::DeleteExpiredCompletedScript;
pub use dequeue::{DequeueScript, Dequeued};
pub use done::DoneScript;
pub use enqueue::EnqueueScript;
pub use enqueue_scheduled::EnqueueScheduledScript;
pub use extend_lease::ExtendLeaseScript;
pub use forward::ForwardScript;
pub use list_lease_expired::ListLeaseExpiredScript;
pub use requeue::RequeueScript;
pub use retry::RetryScript;
pub use trim_archived::TrimArchivedScript;
