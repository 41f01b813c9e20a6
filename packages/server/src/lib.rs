//! Task queue server: a bounded worker pool plus the background services
//! that keep a Redis-backed queue honest (lease recovery, scheduled/retry
//! promotion, roster heartbeats, completed/archived reaping, group
//! aggregation, cancel pub/sub, and periodic task scheduling).
//!
//! [`build_default_services`] wires the standard nine-service topology from
//! a [`Config`]/[`Policy`] pair; an embedding application that needs a
//! different topology can construct [`ServerSupervisor`] directly and add
//! only the services it wants.

pub mod active;
pub mod aggregator;
pub mod config;
pub mod heartbeat;
pub mod janitor;
pub mod periodic;
pub mod processor;
pub mod recoverer;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod subscriber;
pub mod supervisor;
pub mod syncer;

pub use active::{ActiveTaskHandle, ActiveTasks};
pub use config::{Config, Policy};
pub use periodic::{PeriodicEntry, PeriodicTaskConfigProvider, PeriodicTaskManager, TaskTemplate};
pub use registry::{Handler, HandlerRegistry, TaskContext};
pub use service::{build_default_services, Service};
pub use supervisor::ServerSupervisor;
pub use syncer::Syncer;
