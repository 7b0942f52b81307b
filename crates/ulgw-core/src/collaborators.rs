//! Interfaces to the systems the gateway consumes but does not implement:
//! the device registry, the context sink, the command queue and the
//! expression evaluator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::GatewaySettings;
use crate::device::{Attribute, CommandStatus, Device, Group, Transport, TIME_INSTANT};
use crate::error::{GatewayError, GatewayResult};

/// Device and configuration group lookups.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_device_by_api_key_and_id(
        &self,
        api_key: &str,
        device_id: &str,
    ) -> GatewayResult<Option<Device>>;

    async fn get_group_configuration(
        &self,
        resource: &str,
        api_key: &str,
    ) -> GatewayResult<Option<Group>>;

    /// Register the device unless one with the same apikey and id exists.
    async fn create_or_find_device(&self, device: Device) -> GatewayResult<Device>;

    async fn update_device(&self, device: Device) -> GatewayResult<Device>;
}

/// Values pushed by the sink for a subscribed device.
#[derive(Debug, Clone)]
pub struct SinkNotification {
    pub device: Device,
    pub values: Vec<Attribute>,
}

/// Downstream context data service.
#[async_trait]
pub trait ContextSink: Send + Sync {
    async fn update_attributes(&self, device: &Device, attributes: Vec<Attribute>)
        -> GatewayResult<()>;

    async fn query_attributes(&self, device: &Device, names: &[String])
        -> GatewayResult<Vec<Attribute>>;

    async fn subscribe(&self, device: &Device, names: &[String]) -> GatewayResult<()>;

    async fn set_command_result(
        &self,
        device: &Device,
        command: &str,
        value: &str,
        status: CommandStatus,
    ) -> GatewayResult<()>;

    /// Type reported for a measured attribute.
    fn guess_attribute_type(&self, name: &str, device: &Device) -> String {
        if let Some(active) = device.active_attribute(name) {
            return active.kind.clone();
        }
        if name == TIME_INSTANT {
            "DateTime".to_string()
        } else {
            "Text".to_string()
        }
    }

    /// Stream of subscription notifications, if the sink produces any.
    fn notifications(&self) -> Option<broadcast::Receiver<SinkNotification>> {
        None
    }
}

/// Command waiting for a polling device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub api_key: String,
    pub device_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

/// Storage for commands addressed to polling devices.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Queue a command, replacing any queued command of the same name.
    async fn enqueue_command(&self, command: QueuedCommand) -> GatewayResult<()>;

    async fn pending_commands(&self, api_key: &str, device_id: &str)
        -> GatewayResult<Vec<QueuedCommand>>;

    async fn remove_command(&self, api_key: &str, device_id: &str, name: &str)
        -> GatewayResult<()>;
}

/// Evaluates command expressions against a device context.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, String>;
}

impl<F> ExpressionEvaluator for F
where
    F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync,
{
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, String> {
        self(expression, context)
    }
}

/// Evaluator used when no expression language is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpressions;

impl ExpressionEvaluator for NoExpressions {
    fn evaluate(&self, expression: &str, _context: &Value) -> Result<Value, String> {
        Err(format!("no expression evaluator for '{}'", expression))
    }
}

/// Find a device, provisioning it from its apikey group on first contact.
pub async fn retrieve_device(
    registry: &dyn DeviceRegistry,
    device_id: &str,
    api_key: &str,
    transport: Transport,
    settings: &GatewaySettings,
) -> GatewayResult<Device> {
    if let Some(device) = registry
        .find_device_by_api_key_and_id(api_key, device_id)
        .await?
    {
        return Ok(device);
    }

    let group = registry
        .get_group_configuration(&settings.default_resource, api_key)
        .await?
        .ok_or_else(|| GatewayError::GroupNotFound {
            resource: settings.default_resource.clone(),
            api_key: api_key.to_string(),
        })?;

    tracing::debug!(device_id, api_key, "Provisioning device from group");
    let device = Device::from_group(device_id, &group, transport, &settings.default_type);
    registry.create_or_find_device(device).await
}
