//! In-memory collaborators.
//!
//! Used by the standalone binary and by tests. The sink records every call
//! it receives so callers can assert on exact call sequences.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::collaborators::{
    CommandStore, ContextSink, DeviceRegistry, QueuedCommand, SinkNotification,
};
use crate::config::GatewayConfig;
use crate::device::{Attribute, CommandStatus, Device, Group};
use crate::error::{GatewayError, GatewayResult};

/// Registry backed by hash maps.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<HashMap<(String, String), Device>>,
    groups: RwLock<Vec<Group>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the devices and groups of a config file.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut registry = Self::new();
        for group in &config.groups {
            registry = registry.with_group(group.clone());
        }
        for device in &config.devices {
            registry = registry.with_device(device.clone());
        }
        registry
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.devices
            .get_mut()
            .insert((device.api_key.clone(), device.id.clone()), device);
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.get_mut().push(group);
        self
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn find_device_by_api_key_and_id(
        &self,
        api_key: &str,
        device_id: &str,
    ) -> GatewayResult<Option<Device>> {
        let devices = self.devices.read().await;
        Ok(devices
            .get(&(api_key.to_string(), device_id.to_string()))
            .cloned())
    }

    async fn get_group_configuration(
        &self,
        resource: &str,
        api_key: &str,
    ) -> GatewayResult<Option<Group>> {
        let groups = self.groups.read().await;
        Ok(groups
            .iter()
            .find(|g| g.api_key == api_key && g.resource == resource)
            .cloned())
    }

    async fn create_or_find_device(&self, device: Device) -> GatewayResult<Device> {
        let mut devices = self.devices.write().await;
        let key = (device.api_key.clone(), device.id.clone());
        Ok(devices.entry(key).or_insert(device).clone())
    }

    async fn update_device(&self, device: Device) -> GatewayResult<Device> {
        let mut devices = self.devices.write().await;
        let key = (device.api_key.clone(), device.id.clone());
        if !devices.contains_key(&key) {
            return Err(GatewayError::DeviceNotFound(device.id));
        }
        devices.insert(key, device.clone());
        Ok(device)
    }
}

/// Call received by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Update {
        device_id: String,
        attributes: Vec<Attribute>,
    },
    Query {
        device_id: String,
        names: Vec<String>,
    },
    Subscribe {
        device_id: String,
        names: Vec<String>,
    },
    CommandResult {
        device_id: String,
        command: String,
        value: String,
        status: CommandStatus,
    },
}

/// Sink that stores attribute values and records every call.
pub struct MemorySink {
    calls: RwLock<Vec<SinkCall>>,
    values: RwLock<HashMap<(String, String), serde_json::Value>>,
    notifications: broadcast::Sender<SinkNotification>,
    fail_updates: bool,
}

impl Default for MemorySink {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            calls: RwLock::new(Vec::new()),
            values: RwLock::new(HashMap::new()),
            notifications,
            fail_updates: false,
        }
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that rejects every attribute update.
    pub fn failing() -> Self {
        Self {
            fail_updates: true,
            ..Self::default()
        }
    }

    pub async fn set_value(&self, device_id: &str, name: &str, value: impl Into<serde_json::Value>) {
        self.values
            .write()
            .await
            .insert((device_id.to_string(), name.to_string()), value.into());
    }

    pub async fn calls(&self) -> Vec<SinkCall> {
        self.calls.read().await.clone()
    }

    /// Attribute lists of every update call, in order.
    pub async fn updates(&self) -> Vec<Vec<Attribute>> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                SinkCall::Update { attributes, .. } => Some(attributes.clone()),
                _ => None,
            })
            .collect()
    }

    /// (command, value, status) of every command result call, in order.
    pub async fn command_results(&self) -> Vec<(String, String, CommandStatus)> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                SinkCall::CommandResult {
                    command,
                    value,
                    status,
                    ..
                } => Some((command.clone(), value.clone(), *status)),
                _ => None,
            })
            .collect()
    }

    /// Push a subscription notification to listeners.
    pub fn notify(&self, device: Device, values: Vec<Attribute>) -> usize {
        self.notifications
            .send(SinkNotification { device, values })
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContextSink for MemorySink {
    async fn update_attributes(
        &self,
        device: &Device,
        attributes: Vec<Attribute>,
    ) -> GatewayResult<()> {
        if self.fail_updates {
            return Err(GatewayError::Sink(format!(
                "update rejected for device {}",
                device.id
            )));
        }
        {
            let mut values = self.values.write().await;
            for attr in &attributes {
                values.insert((device.id.clone(), attr.name.clone()), attr.value.clone());
            }
        }
        self.calls.write().await.push(SinkCall::Update {
            device_id: device.id.clone(),
            attributes,
        });
        Ok(())
    }

    async fn query_attributes(
        &self,
        device: &Device,
        names: &[String],
    ) -> GatewayResult<Vec<Attribute>> {
        self.calls.write().await.push(SinkCall::Query {
            device_id: device.id.clone(),
            names: names.to_vec(),
        });
        let values = self.values.read().await;
        Ok(names
            .iter()
            .map(|name| {
                let value = values
                    .get(&(device.id.clone(), name.clone()))
                    .cloned()
                    .unwrap_or(serde_json::Value::String(String::new()));
                Attribute::new(name.clone(), self.guess_attribute_type(name, device), value)
            })
            .collect())
    }

    async fn subscribe(&self, device: &Device, names: &[String]) -> GatewayResult<()> {
        self.calls.write().await.push(SinkCall::Subscribe {
            device_id: device.id.clone(),
            names: names.to_vec(),
        });
        Ok(())
    }

    async fn set_command_result(
        &self,
        device: &Device,
        command: &str,
        value: &str,
        status: CommandStatus,
    ) -> GatewayResult<()> {
        self.calls.write().await.push(SinkCall::CommandResult {
            device_id: device.id.clone(),
            command: command.to_string(),
            value: value.to_string(),
            status,
        });
        Ok(())
    }

    fn notifications(&self) -> Option<broadcast::Receiver<SinkNotification>> {
        Some(self.notifications.subscribe())
    }
}

/// Command queue backed by a vector.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    commands: RwLock<Vec<QueuedCommand>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.commands.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.commands.read().await.is_empty()
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn enqueue_command(&self, command: QueuedCommand) -> GatewayResult<()> {
        let mut commands = self.commands.write().await;
        commands.retain(|c| {
            !(c.api_key == command.api_key
                && c.device_id == command.device_id
                && c.name == command.name)
        });
        commands.push(command);
        Ok(())
    }

    async fn pending_commands(
        &self,
        api_key: &str,
        device_id: &str,
    ) -> GatewayResult<Vec<QueuedCommand>> {
        let commands = self.commands.read().await;
        Ok(commands
            .iter()
            .filter(|c| c.api_key == api_key && c.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn remove_command(&self, api_key: &str, device_id: &str, name: &str) -> GatewayResult<()> {
        let mut commands = self.commands.write().await;
        commands.retain(|c| !(c.api_key == api_key && c.device_id == device_id && c.name == name));
        Ok(())
    }
}
