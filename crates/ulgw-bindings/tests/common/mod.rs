//! Common test utilities for binding tests.

#![allow(dead_code)]

pub mod broker;

use std::sync::Arc;
use std::time::Duration;

use ulgw_bindings::GatewayContext;
use ulgw_core::{
    Device, GatewayConfig, Group, MemoryCommandStore, MemoryRegistry, MemorySink, Transport,
};

pub struct TestContext {
    pub ctx: GatewayContext,
    pub sink: Arc<MemorySink>,
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<MemoryCommandStore>,
}

/// Config with the HTTP binding on an ephemeral local port and no brokers.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.http.host = "127.0.0.1".to_string();
    config.http.port = 0;
    config.http.timeout_ms = Some(2000);
    config
}

/// Registry with `dev1` (apikey 1234) and a `1234` group.
pub fn test_registry() -> MemoryRegistry {
    MemoryRegistry::new()
        .with_group(Group::new("1234", "Sensor"))
        .with_device(Device::new("dev1", "1234").with_transport(Transport::Http))
}

pub fn setup(config: GatewayConfig, registry: MemoryRegistry) -> TestContext {
    let sink = Arc::new(MemorySink::new());
    let registry = Arc::new(registry);
    let store = Arc::new(MemoryCommandStore::new());
    let ctx = GatewayContext::new(config, registry.clone(), sink.clone(), store.clone());
    TestContext {
        ctx,
        sink,
        registry,
        store,
    }
}

pub fn default_setup() -> TestContext {
    setup(test_config(), test_registry())
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    wait_for(Duration::from_secs(1), check).await
}

/// Poll `check` every 10ms until it holds or `limit` has passed.
pub async fn wait_for<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
