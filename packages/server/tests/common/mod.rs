//! Shared Redis testcontainer for the server crate's end-to-end tests,
//! mirroring the broker crate's own harness (`packages/broker/tests/common`).

use broker::RedisBroker;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

struct SharedRedis {
    url: String,
    _container: ContainerAsync<Redis>,
}

static SHARED: OnceCell<SharedRedis> = OnceCell::const_new();

impl SharedRedis {
    async fn init() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("failed to start redis container");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("container port");
        Self {
            url: format!("redis://{host}:{port}"),
            _container: container,
        }
    }

    async fn get() -> &'static Self {
        SHARED.get_or_init(Self::init).await
    }
}

pub struct ServerHarness {
    pub broker: RedisBroker,
}

impl AsyncTestContext for ServerHarness {
    async fn setup() -> Self {
        let shared = SharedRedis::get().await;
        let broker = RedisBroker::connect(&shared.url)
            .await
            .expect("failed to connect broker to test redis");
        Self { broker }
    }
}

/// Poll `cond` every 30ms until it returns `true` or `timeout` elapses.
/// Returns whether the condition was observed `true`.
pub async fn wait_until<F, Fut>(timeout: std::time::Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }
}
