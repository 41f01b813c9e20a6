//! # broker
//!
//! The atomic script layer and typed façade for a distributed, Redis-backed
//! task queue. A client enqueues an opaque, typed task; a server dequeues it
//! under a lease, runs a handler, and settles the outcome (done/retry/
//! archive) through the same atomic scripts.
//!
//! ## Layering
//!
//! ```text
//! Client::enqueue()
//!     └─► RedisBroker::enqueue() / enqueue_scheduled()
//!             └─► script::EnqueueScript (Lua, atomic)
//!
//! Processor (in the `server` crate)
//!     └─► RedisBroker::dequeue() / done() / retry() / archive()
//!             └─► script::{Dequeue,Done,Retry,Archive}Script
//! ```
//!
//! ## Guarantees
//!
//! - At-least-once delivery: a task is redelivered whenever its lease
//!   expires before it settles.
//! - Exactly-one in-flight: membership in `active` plus a matching `lease`
//!   entry is the only notion of ownership: see [`script`] for the scripts
//!   that keep those two pieces of state consistent.
//! - No ordering guarantee beyond best-effort FIFO within one queue.
//!
//! This crate does not run any background loops itself — those live in the
//! `server` crate, which polls through [`RedisBroker`] on a schedule. This
//! crate only owns the store contract: key naming, encoding, and atomicity.

pub mod broker;
pub mod client;
pub mod error;
pub mod keys;
pub mod script;
pub mod task;

pub use broker::RedisBroker;
pub use client::{Client, TaskOptions};
pub use error::BrokerError;
pub use task::{now_epoch, Epoch, Task};
