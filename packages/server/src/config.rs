//! Environment-driven configuration for the numeric/timing knobs in the
//! configuration surface. The behavioral knobs (`retry_delay`, `is_failure`,
//! `health_check`, `group_aggregator`) are closures supplied by the embedding
//! application, not environment variables — see [`Policy`].

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Environment-loaded configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,

    /// Bounded worker pool size.
    pub concurrency: usize,

    /// Queue name -> priority/weight. Interpretation depends on
    /// `strict_priority`.
    pub queues: HashMap<String, u32>,

    /// `true`: queues are tried in strict descending-weight order, ties
    /// shuffled. `false`: queues are sampled without replacement, weighted.
    pub strict_priority: bool,

    pub lease_duration: Duration,
    pub shutdown_timeout: Duration,
    pub health_check_interval: Duration,
    pub delayed_task_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub recoverer_interval: Duration,
    pub janitor_interval: Duration,
    pub janitor_batch_size: u64,
    pub aggregator_interval: Duration,
    pub periodic_sync_interval: Duration,

    /// Maximum entries kept in `archived`; 0 = unbounded.
    pub archive_capacity: u64,

    /// Idle backoff when a dequeue attempt finds nothing.
    pub idle_backoff: Duration,

    /// Group aggregation policy per queue; a queue with no entry here has
    /// aggregation disabled even if tasks are enqueued with a `group_key`
    /// (they simply accumulate until a policy is configured).
    pub group_policies: HashMap<String, GroupPolicyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            concurrency: 10,
            queues: HashMap::from([("default".to_string(), 1)]),
            strict_priority: false,
            lease_duration: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(8),
            health_check_interval: Duration::from_secs(15),
            delayed_task_check_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            recoverer_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(8),
            janitor_batch_size: 100,
            aggregator_interval: Duration::from_secs(1),
            periodic_sync_interval: Duration::from_secs(180),
            archive_capacity: 10_000,
            idle_backoff: Duration::from_millis(500),
            group_policies: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        let defaults = Self::default();

        let redis_url =
            env::var("REDIS_URL").unwrap_or(defaults.redis_url);

        let concurrency = env_parsed("CONCURRENCY", defaults.concurrency)?;

        let queues = match env::var("QUEUES") {
            Ok(raw) => parse_queues(&raw)?,
            Err(_) => defaults.queues,
        };

        let strict_priority = env_parsed("STRICT_PRIORITY", defaults.strict_priority)?;

        Ok(Self {
            redis_url,
            concurrency,
            queues,
            strict_priority,
            lease_duration: env_duration_secs("LEASE_DURATION_SECS", defaults.lease_duration)?,
            shutdown_timeout: env_duration_secs(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
            health_check_interval: env_duration_secs(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            delayed_task_check_interval: env_duration_secs(
                "DELAYED_TASK_CHECK_INTERVAL_SECS",
                defaults.delayed_task_check_interval,
            )?,
            heartbeat_interval: env_duration_secs(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            recoverer_interval: env_duration_secs(
                "RECOVERER_INTERVAL_SECS",
                defaults.recoverer_interval,
            )?,
            janitor_interval: env_duration_secs("JANITOR_INTERVAL_SECS", defaults.janitor_interval)?,
            janitor_batch_size: env_parsed("JANITOR_BATCH_SIZE", defaults.janitor_batch_size)?,
            aggregator_interval: env_duration_secs(
                "AGGREGATOR_INTERVAL_SECS",
                defaults.aggregator_interval,
            )?,
            periodic_sync_interval: env_duration_secs(
                "PERIODIC_SYNC_INTERVAL_SECS",
                defaults.periodic_sync_interval,
            )?,
            archive_capacity: env_parsed("ARCHIVE_CAPACITY", defaults.archive_capacity)?,
            idle_backoff: defaults.idle_backoff,
            // Group policies are code, not environment data (same rationale
            // as `Policy`'s closures) — the embedding application populates
            // `group_policies` on the returned `Config` before handing it to
            // the supervisor builder.
            group_policies: defaults.group_policies,
        })
    }

    /// Queues in priority order: highest weight first, as `strict_priority`
    /// consults directly; weighted sampling (see `processor::select_queues`)
    /// uses the same list as its sampling population.
    pub fn queues_by_priority(&self) -> Vec<(String, u32)> {
        let mut queues: Vec<(String, u32)> =
            self.queues.iter().map(|(k, v)| (k.clone(), *v)).collect();
        queues.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        queues
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be a valid number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn parse_queues(raw: &str) -> Result<HashMap<String, u32>> {
    let mut queues = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, weight) = entry
            .split_once(':')
            .with_context(|| format!("QUEUES entry '{entry}' must be name:weight"))?;
        let weight: u32 = weight
            .trim()
            .parse()
            .with_context(|| format!("QUEUES weight for '{name}' must be a positive integer"))?;
        queues.insert(name.trim().to_string(), weight);
    }
    if queues.is_empty() {
        anyhow::bail!("QUEUES must list at least one queue");
    }
    Ok(queues)
}

/// Function supplied to compute the next retry delay. `n` is the retry count
/// about to be consumed (1-indexed: the first failure passes 1).
pub type RetryDelayFn = std::sync::Arc<dyn Fn(u32, &str) -> Duration + Send + Sync>;

/// Classifies a handler error as "skip retry, go straight to archive" when
/// it returns `true`.
pub type SkipRetryFn = std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Observes background-loop and processor errors for external alerting.
pub type HealthCheckFn = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// Folds a batch of group members (oldest first) into one aggregated task.
/// The aggregated payload's shape is opaque to this crate.
pub type GroupAggregatorFn =
    std::sync::Arc<dyn Fn(Vec<broker::Task>) -> broker::Task + Send + Sync>;

/// Behavioral knobs that cannot be expressed as environment variables
/// because they are code, not data. Constructed by the embedding
/// application and passed into [`crate::supervisor::ServerSupervisor`].
#[derive(Clone)]
pub struct Policy {
    pub retry_delay: RetryDelayFn,
    pub skip_retry: SkipRetryFn,
    pub health_check: HealthCheckFn,
    pub group_aggregator: Option<GroupAggregatorFn>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            retry_delay: std::sync::Arc::new(default_retry_delay),
            skip_retry: std::sync::Arc::new(|_err| false),
            health_check: std::sync::Arc::new(|err| tracing::warn!(%err, "health check observed error")),
            group_aggregator: None,
        }
    }
}

/// Per-queue group aggregation knobs, per spec.md §4.7. `0` disables a
/// trigger.
#[derive(Debug, Clone, Copy)]
pub struct GroupPolicyConfig {
    pub max_size: u64,
    pub max_delay: Duration,
    pub grace_period: Duration,
}

impl Default for GroupPolicyConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            max_delay: Duration::ZERO,
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff with jitter: `2^n` seconds, capped at one hour, plus
/// up to 30% random jitter to avoid thundering-herd retries.
fn default_retry_delay(n: u32, _err: &str) -> Duration {
    let base = 2u64.saturating_pow(n.min(20)).min(3600);
    let jitter = rand::random::<f64>() * 0.3 * base as f64;
    Duration::from_secs_f64(base as f64 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_queues_reads_name_weight_pairs() {
        let queues = parse_queues("critical:6,default:3,low:1").unwrap();
        assert_eq!(queues.get("critical"), Some(&6));
        assert_eq!(queues.get("default"), Some(&3));
        assert_eq!(queues.get("low"), Some(&1));
    }

    #[test]
    fn parse_queues_rejects_empty() {
        assert!(parse_queues("").is_err());
    }

    #[test]
    fn queues_by_priority_orders_descending() {
        let mut config = Config::default();
        config.queues = HashMap::from([
            ("low".to_string(), 1),
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
        ]);
        let ordered = config.queues_by_priority();
        assert_eq!(ordered[0].0, "critical");
        assert_eq!(ordered[1].0, "default");
        assert_eq!(ordered[2].0, "low");
    }

    #[test]
    fn default_retry_delay_grows_and_caps() {
        let d1 = default_retry_delay(1, "x");
        let d10 = default_retry_delay(10, "x");
        assert!(d10 > d1);
        let d_big = default_retry_delay(100, "x");
        assert!(d_big.as_secs() <= 3600 * 2);
    }
}
