//! Shared Redis testcontainer for the broker's integration tests.
//!
//! One container is started on first use and reused by every test in the
//! binary, matching the shared-infra pattern the server crate's own
//! integration tests use.

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

pub struct BrokerHarness {
    pub broker: RedisBroker,
}

impl AsyncTestContext for BrokerHarness {
    async fn setup() -> Self {
        let shared = SharedRedis::get().await;
        let broker = RedisBroker::connect(&shared.url)
            .await
            .expect("failed to connect broker to test redis");
        Self { broker }
    }
}
