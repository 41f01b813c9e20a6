//! Aggregator: groups tasks sharing a `group_key` and emits a single
//! combined task once a policy trigger fires. Per spec.md §4.7, three
//! independent triggers apply per `(queue, group)`: `max_size` members,
//! `max_delay` since the oldest member, or `grace_period` since the newest
//! (a quiet-period/debounce trigger). Any of the three firing is enough.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use broker::{script::GroupPolicy, RedisBroker, Task};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::{GroupAggregatorFn, GroupPolicyConfig};
use crate::service::Service;

pub struct Aggregator {
    broker: RedisBroker,
    policies: HashMap<String, GroupPolicyConfig>,
    aggregator_fn: Option<GroupAggregatorFn>,
    interval: Duration,
}

impl Aggregator {
    pub fn new(
        broker: RedisBroker,
        policies: HashMap<String, GroupPolicyConfig>,
        aggregator_fn: Option<GroupAggregatorFn>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            policies,
            aggregator_fn,
            interval,
        }
    }

    async fn tick(&self) {
        let Some(aggregator_fn) = &self.aggregator_fn else {
            return;
        };

        for (queue, policy) in &self.policies {
            let groups = match self.broker.active_groups(queue).await {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "active_groups failed");
                    continue;
                }
            };

            for group in groups {
                self.check_group(queue, &group, policy, aggregator_fn).await;
            }
        }
    }

    async fn check_group(
        &self,
        queue: &str,
        group: &str,
        policy: &GroupPolicyConfig,
        aggregator_fn: &GroupAggregatorFn,
    ) {
        let script_policy = GroupPolicy {
            max_size: policy.max_size,
            max_delay: policy.max_delay.as_secs(),
            grace_period: policy.grace_period.as_secs(),
        };

        let members = match self.broker.aggregation_check(queue, group, &script_policy).await {
            Ok(members) => members,
            Err(e) => {
                warn!(queue = %queue, group = %group, error = %e, "aggregation_check failed");
                return;
            }
        };
        if members.is_empty() {
            return;
        }

        let blobs = match self.broker.get_task_blobs(queue, &members).await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(queue = %queue, group = %group, error = %e, "fetching group member blobs failed");
                return;
            }
        };

        let tasks: Vec<Task> = blobs
            .into_iter()
            .flatten()
            .filter_map(|blob| Task::decode(&blob).ok())
            .collect();
        if tasks.is_empty() {
            return;
        }

        let new_task = aggregator_fn(tasks.clone());
        if let Err(e) = self
            .broker
            .commit_aggregation(queue, group, &new_task, &tasks)
            .await
        {
            error!(queue = %queue, group = %group, error = %e, "commit_aggregation failed");
        }
    }
}

#[async_trait::async_trait]
impl Service for Aggregator {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        Ok(())
    }
}
