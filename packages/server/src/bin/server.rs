//! Standalone server binary. Task handlers are application-specific, so this
//! binary wires up only the `example:log` handler as a smoke test of the
//! supervisor topology; an embedding application is expected to construct
//! its own `HandlerRegistry` and call `server_core::build_default_services`
//! directly rather than run this binary in production.

use std::sync::Arc;

use anyhow::Result;
use broker::RedisBroker;
use server_core::registry::{Handler, TaskContext};
use server_core::{build_default_services, Config, HandlerRegistry, Policy};
use tracing_subscriber::EnvFilter;

struct LogHandler;

#[async_trait::async_trait]
impl Handler for LogHandler {
    async fn run(&self, ctx: &TaskContext, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        tracing::info!(task_id = %ctx.id, bytes = payload.len(), "example:log handler ran");
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let policy = Policy::default();

    let broker = RedisBroker::connect(&config.redis_url).await?;

    let mut handlers = HandlerRegistry::new();
    handlers.register("example:log", Arc::new(LogHandler) as Arc<dyn Handler>);

    let supervisor = build_default_services(broker, config, policy, handlers, None);
    supervisor.run_until_ctrl_c().await
}
