//! Server supervisor: owns service lifecycle and graceful shutdown.
//!
//! Start order is heartbeat -> subscriber -> syncer -> periodic -> recoverer
//! -> scheduler -> janitor -> aggregator -> processor, so that liveness
//! publishing and cancellation plumbing are live before anything starts
//! leasing tasks. Shutdown broadcasts cancellation to every service at once
//! (the processor stops accepting new tasks and drains in-flight handlers
//! under its own `shutdown_timeout`) then waits, in reverse start order, for
//! each service to report back within the same timeout.
//!
//! # Example
//!
//! ```ignore
//! ServerSupervisor::new(config.shutdown_timeout)
//!     .with_service(Box::new(heartbeat))
//!     .with_service(Box::new(subscriber))
//!     .with_service(Box::new(syncer))
//!     .with_service(Box::new(periodic))
//!     .with_service(Box::new(recoverer))
//!     .with_service(Box::new(scheduler))
//!     .with_service(Box::new(janitor))
//!     .with_service(Box::new(aggregator))
//!     .with_service(Box::new(processor))
//!     .run_until_ctrl_c()
//!     .await?;
//! ```

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::service::Service;

pub struct ServerSupervisor {
    services: Vec<Box<dyn Service>>,
    shutdown_timeout: Duration,
}

impl ServerSupervisor {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            shutdown_timeout,
        }
    }

    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Run every service until Ctrl-C, then shut down gracefully.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run every service until `shutdown_signal` resolves, then shut down
    /// gracefully.
    pub async fn run_until(self, shutdown_signal: impl std::future::Future<Output = ()>) -> Result<()> {
        let root = CancellationToken::new();
        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        for service in self.services {
            let name = service.name();
            let child = root.child_token();
            info!(service = name, "starting service");
            let handle = tokio::spawn(async move { service.run(child).await });
            handles.push((name, handle));
        }

        shutdown_signal.await;
        info!("shutdown signal received, cancelling all services");
        root.cancel();

        let deadline = Instant::now() + self.shutdown_timeout;
        for (name, handle) in handles.into_iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(Ok(()))) => info!(service = name, "service stopped cleanly"),
                Ok(Ok(Err(e))) => error!(service = name, error = %e, "service exited with error"),
                Ok(Err(e)) => error!(service = name, error = %e, "service task panicked"),
                Err(_) => warn!(service = name, "service did not stop within shutdown_timeout"),
            }
        }

        Ok(())
    }
}
