//! Subscriber: listens for `cancel:<task_id>` pub/sub messages and triggers
//! the matching in-flight task's cancellation handle. Per spec.md §4.8,
//! unknown ids are ignored — the task may have already settled, or be
//! owned by a different server entirely.

use anyhow::Result;
use broker::{keys, RedisBroker};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::active::ActiveTasks;
use crate::service::Service;

pub struct Subscriber {
    broker: RedisBroker,
    active: ActiveTasks,
}

impl Subscriber {
    pub fn new(broker: RedisBroker, active: ActiveTasks) -> Self {
        Self { broker, active }
    }
}

#[async_trait::async_trait]
impl Service for Subscriber {
    fn name(&self) -> &'static str {
        "subscriber"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut pubsub = self.broker.cancel_subscription().await?;
        let mut messages = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe_msg = messages.next() => {
                    let Some(msg) = maybe_msg else { break };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "cancel message payload decode failed");
                            continue;
                        }
                    };

                    match keys::parse_cancel_message(&payload) {
                        Some(task_id) => {
                            let cancelled = self.active.cancel(task_id).await;
                            debug!(task_id, cancelled, "cancel message received");
                        }
                        None => warn!(payload = %payload, "unrecognized pub/sub message on cancel channel"),
                    }
                }
            }
        }

        Ok(())
    }
}
