//! The `Service` trait every background loop and the processor implement,
//! plus [`build_default_services`] which assembles the standard topology.

use std::sync::Arc;

use anyhow::Result;
use broker::RedisBroker;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveTasks;
use crate::config::{Config, Policy};
use crate::periodic::{PeriodicTaskConfigProvider, PeriodicTaskManager};
use crate::registry::HandlerRegistry;
use crate::supervisor::ServerSupervisor;
use crate::syncer::Syncer;
use crate::{aggregator, heartbeat, janitor, processor, recoverer, scheduler, subscriber, syncer};

/// One independently cancellable server loop.
///
/// `run` takes ownership of `self` (boxed) so the supervisor can spawn it
/// onto its own task without the service needing `Clone` or interior
/// mutability for its top-level state.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Assemble the standard nine-service topology (heartbeat, subscriber,
/// syncer, periodic, recoverer, scheduler, janitor, aggregator, processor)
/// into a supervisor ready to run. `periodic_provider` is optional: `None`
/// skips starting the periodic task manager entirely, for embedders with no
/// cron-driven tasks.
pub fn build_default_services(
    broker: RedisBroker,
    config: Config,
    policy: Policy,
    handlers: HandlerRegistry,
    periodic_provider: Option<Arc<dyn PeriodicTaskConfigProvider>>,
) -> ServerSupervisor {
    let active = ActiveTasks::new();
    let (syncer, syncer_receiver) = Syncer::new();
    let handlers = Arc::new(handlers);
    let queues: Vec<String> = config.queues.keys().cloned().collect();

    let heartbeat = heartbeat::Heartbeat::new(
        broker.clone(),
        active.clone(),
        uuid::Uuid::new_v4().to_string(),
        config.concurrency,
        queues.clone(),
        config.heartbeat_interval,
        config.lease_duration,
    );

    let subscriber = subscriber::Subscriber::new(broker.clone(), active.clone());

    let syncer_service = syncer::SyncerService::new(broker.clone(), syncer_receiver, config.shutdown_timeout);

    let recoverer = recoverer::Recoverer::new(
        broker.clone(),
        queues.clone(),
        config.recoverer_interval,
        config.archive_capacity,
    );

    let scheduler = scheduler::Scheduler::new(broker.clone(), queues.clone(), config.delayed_task_check_interval);

    let janitor = janitor::Janitor::new(
        broker.clone(),
        queues.clone(),
        config.janitor_interval,
        config.janitor_batch_size,
        config.archive_capacity,
    );

    let aggregator = aggregator::Aggregator::new(
        broker.clone(),
        config.group_policies.clone(),
        policy.group_aggregator.clone(),
        config.aggregator_interval,
    );

    let processor = processor::Processor::new(
        broker.clone(),
        config.clone(),
        policy,
        handlers,
        active.clone(),
        syncer.clone(),
    );

    let mut supervisor = ServerSupervisor::new(config.shutdown_timeout)
        .with_service(Box::new(heartbeat))
        .with_service(Box::new(subscriber))
        .with_service(Box::new(syncer_service));

    if let Some(provider) = periodic_provider {
        let client = broker::Client::new(broker.clone());
        let periodic = PeriodicTaskManager::new(client, provider, config.periodic_sync_interval);
        supervisor = supervisor.with_service(Box::new(periodic));
    }

    supervisor
        .with_service(Box::new(recoverer))
        .with_service(Box::new(scheduler))
        .with_service(Box::new(janitor))
        .with_service(Box::new(aggregator))
        .with_service(Box::new(processor))
}
