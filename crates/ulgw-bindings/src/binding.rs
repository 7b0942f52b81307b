//! Transport binding interface.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use ulgw_codec::{serialize_command_payload, EncodedPayload};
use ulgw_commands::CommandCorrelator;
use ulgw_core::{
    Attribute, CommandStore, ContextSink, Device, DeviceRegistry, ExpressionEvaluator,
    GatewayConfig, GatewayResult, NoExpressions, Transport,
};

/// Device-facing I/O over one transport.
///
/// Each binding owns its connection handles: they are created in `start`
/// and released in `stop`.
#[async_trait]
pub trait TransportBinding: Send + Sync {
    /// Transport this binding serves.
    fn protocol(&self) -> Transport;

    async fn start(&self) -> GatewayResult<()>;

    async fn stop(&self) -> GatewayResult<()>;

    /// Send a command to a device.
    async fn command_handler(&self, device: &Device, command: &str, value: &Value)
        -> GatewayResult<()>;

    /// Push configuration values to a subscribed device.
    async fn notification_handler(&self, device: &Device, values: &[Attribute])
        -> GatewayResult<()>;

    /// Adjust a device being provisioned.
    async fn provisioning_handler(&self, device: Device) -> GatewayResult<Device>;

    /// Adjust a device being updated.
    async fn updating_handler(&self, device: Device, previous: &Device) -> GatewayResult<Device>;
}

/// Shared collaborators handed to every binding.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub sink: Arc<dyn ContextSink>,
    pub commands: Arc<dyn CommandStore>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub correlator: Arc<CommandCorrelator>,
}

impl GatewayContext {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn ContextSink>,
        commands: Arc<dyn CommandStore>,
    ) -> Self {
        let correlator = Arc::new(CommandCorrelator::new(sink.clone()));
        Self {
            config: Arc::new(config),
            registry,
            sink,
            commands,
            evaluator: Arc::new(NoExpressions),
            correlator,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Encode a command line for a device.
    pub fn encode_command(
        &self,
        device: &Device,
        command: &str,
        value: &Value,
    ) -> GatewayResult<EncodedPayload> {
        Ok(serialize_command_payload(
            device,
            command,
            value,
            self.evaluator.as_ref(),
        )?)
    }
}
