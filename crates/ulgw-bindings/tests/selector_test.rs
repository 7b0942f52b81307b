//! Transport selector routing tests with mock bindings.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ulgw_bindings::{TransportBinding, TransportSelector};
use ulgw_core::{Attribute, Device, GatewayError, GatewayResult, Transport};

struct MockBinding {
    protocol: Transport,
    fail: bool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    commands: AtomicUsize,
}

impl MockBinding {
    fn new(protocol: Transport) -> Arc<Self> {
        Self::build(protocol, false)
    }

    fn failing(protocol: Transport) -> Arc<Self> {
        Self::build(protocol, true)
    }

    fn build(protocol: Transport, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            fail,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            commands: AtomicUsize::new(0),
        })
    }

    fn outcome(&self) -> GatewayResult<()> {
        if self.fail {
            Err(GatewayError::Transport(format!("{} is down", self.protocol)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportBinding for MockBinding {
    fn protocol(&self) -> Transport {
        self.protocol
    }

    async fn start(&self) -> GatewayResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn stop(&self) -> GatewayResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn command_handler(&self, _device: &Device, _command: &str, _value: &Value) -> GatewayResult<()> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn notification_handler(&self, _device: &Device, _values: &[Attribute]) -> GatewayResult<()> {
        self.outcome()
    }

    async fn provisioning_handler(&self, mut device: Device) -> GatewayResult<Device> {
        device.entity_type = self.protocol.to_string();
        Ok(device)
    }

    async fn updating_handler(&self, device: Device, _previous: &Device) -> GatewayResult<Device> {
        Ok(device)
    }
}

#[tokio::test]
async fn test_broadcast_start_fails_if_any_binding_fails() {
    let selector = TransportSelector::new();
    let http = MockBinding::new(Transport::Http);
    let mqtt = MockBinding::failing(Transport::Mqtt);
    selector.register(http.clone()).await;
    selector.register(mqtt.clone()).await;

    let result = selector
        .apply_function_from_binding(None, |b: Arc<dyn TransportBinding>| async move {
            b.start().await
        })
        .await;

    assert!(matches!(result, Err(GatewayError::Transport(_))));
    assert_eq!(http.starts.load(Ordering::SeqCst), 1);
    assert_eq!(mqtt.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broadcast_start_succeeds_when_all_succeed() {
    let selector = TransportSelector::new();
    selector.register(MockBinding::new(Transport::Http)).await;
    selector.register(MockBinding::new(Transport::Amqp)).await;

    let results = selector
        .apply_function_from_binding(None, |b: Arc<dyn TransportBinding>| async move {
            b.start().await
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_broadcast_results_follow_transport_order() {
    let selector = TransportSelector::new();
    selector.register(MockBinding::new(Transport::Amqp)).await;
    selector.register(MockBinding::new(Transport::Http)).await;
    selector.register(MockBinding::new(Transport::Mqtt)).await;

    let device = Device::new("dev1", "1234");
    let devices = selector
        .apply_function_from_binding(None, |b: Arc<dyn TransportBinding>| {
            let device = device.clone();
            async move { b.provisioning_handler(device).await }
        })
        .await
        .unwrap();

    let kinds: Vec<&str> = devices.iter().map(|d| d.entity_type.as_str()).collect();
    assert_eq!(kinds, vec!["HTTP", "MQTT", "AMQP"]);
}

#[tokio::test]
async fn test_single_protocol_routing() {
    let selector = TransportSelector::new();
    let http = MockBinding::new(Transport::Http);
    let mqtt = MockBinding::new(Transport::Mqtt);
    selector.register(http.clone()).await;
    selector.register(mqtt.clone()).await;

    let device = Device::new("dev1", "1234");
    let results = selector
        .apply_function_from_binding(Some(Transport::Mqtt), |b: Arc<dyn TransportBinding>| {
            let device = device.clone();
            async move { b.command_handler(&device, "ping", &Value::Null).await }
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(mqtt.commands.load(Ordering::SeqCst), 1);
    assert_eq!(http.commands.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_protocol_is_configuration_error() {
    let selector = TransportSelector::new();
    selector.register(MockBinding::new(Transport::Http)).await;

    let result = selector
        .apply_to(Transport::Amqp, |b: Arc<dyn TransportBinding>| async move {
            b.start().await
        })
        .await;
    assert!(matches!(result, Err(GatewayError::Configuration(_))));
}

#[tokio::test]
async fn test_start_registers_only_started_bindings() {
    let selector = TransportSelector::new();
    let http = MockBinding::new(Transport::Http);
    let amqp = MockBinding::failing(Transport::Amqp);

    let bindings: Vec<Arc<dyn TransportBinding>> = vec![http.clone(), amqp.clone()];
    let result = selector.start_bindings(bindings).await;

    assert!(result.is_err());
    assert_eq!(amqp.starts.load(Ordering::SeqCst), 1);
    assert_eq!(selector.protocols().await, vec![Transport::Http]);
}

#[tokio::test]
async fn test_stop_tolerates_failures() {
    let selector = TransportSelector::new();
    let http = MockBinding::new(Transport::Http);
    let mqtt = MockBinding::failing(Transport::Mqtt);
    selector.register(http.clone()).await;
    selector.register(mqtt.clone()).await;

    selector.stop_transport_bindings().await;

    assert_eq!(http.stops.load(Ordering::SeqCst), 1);
    assert_eq!(mqtt.stops.load(Ordering::SeqCst), 1);
    assert!(selector.protocols().await.is_empty());
}
