//! Device model as seen by the gateway.
//!
//! Devices and groups are owned by the external registry. The gateway only
//! reads them, except for the `polling` flag set during provisioning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// Reserved attribute name for measure timestamps.
pub const TIME_INSTANT: &str = "TimeInstant";

/// Transport a device talks over.
///
/// The ordering (HTTP, MQTT, AMQP) is the order bindings are started and
/// the order broadcast results are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Http,
    Mqtt,
    Amqp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Mqtt => "MQTT",
            Self::Amqp => "AMQP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Self::Http),
            "MQTT" => Ok(Self::Mqtt),
            "AMQP" => Ok(Self::Amqp),
            other => Err(GatewayError::Configuration(format!(
                "unknown transport '{}'",
                other
            ))),
        }
    }
}

/// Status of an outstanding command, as reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Delivered,
    Completed,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivered => "DELIVERED",
            Self::Completed => "OK",
            Self::Error => "ERROR",
        }
    }

    /// Terminal states clear the outstanding record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Canonical attribute update item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", default = "default_attribute_type")]
    pub kind: String,
    pub value: serde_json::Value,
}

fn default_attribute_type() -> String {
    "Text".to_string()
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Value rendered the way it travels on the wire.
    pub fn value_text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Declared attribute with an optional short wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAttribute {
    #[serde(default)]
    pub object_id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default = "default_attribute_type")]
    pub kind: String,
}

/// Per-command MQTT publish overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttCommandOptions {
    #[serde(default)]
    pub qos: Option<u8>,
    #[serde(default)]
    pub retain: Option<bool>,
}

/// Command a device accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub name: String,
    #[serde(rename = "type", default = "default_command_type")]
    pub kind: String,
    /// Expression whose result replaces the literal attribute encoding
    #[serde(default)]
    pub expression: Option<String>,
    /// One of binaryFromString, binaryFromHex, binaryFromJson, json
    #[serde(default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttCommandOptions>,
}

fn default_command_type() -> String {
    "command".to_string()
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_command_type(),
            expression: None,
            payload_type: None,
            mqtt: None,
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn with_mqtt(mut self, qos: Option<u8>, retain: Option<bool>) -> Self {
        self.mqtt = Some(MqttCommandOptions { qos, retain });
        self
    }
}

/// Provisioned device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub api_key: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub transport: Option<Transport>,
    /// Push URL; devices without one poll for commands
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub polling: bool,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    #[serde(default)]
    pub active: Vec<ActiveAttribute>,
    #[serde(default)]
    pub static_attributes: Vec<Attribute>,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub subservice: String,
}

impl Device {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            entity_name: id.clone(),
            id,
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.entity_name = name.into();
        self.entity_type = kind.into();
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_command(mut self, command: DeviceCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_active(mut self, attribute: ActiveAttribute) -> Self {
        self.active.push(attribute);
        self
    }

    pub fn with_static_attribute(mut self, attribute: Attribute) -> Self {
        self.static_attributes.push(attribute);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>, subservice: impl Into<String>) -> Self {
        self.service = service.into();
        self.subservice = subservice.into();
        self
    }

    pub fn command(&self, name: &str) -> Option<&DeviceCommand> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Active attribute matching a wire name, by object id first.
    pub fn active_attribute(&self, name: &str) -> Option<&ActiveAttribute> {
        self.active
            .iter()
            .find(|a| a.object_id.as_deref() == Some(name))
            .or_else(|| self.active.iter().find(|a| a.name == name))
    }

    pub fn is_push(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Build an unregistered device from its configuration group.
    pub fn from_group(
        id: impl Into<String>,
        group: &Group,
        fallback_transport: Transport,
        fallback_type: &str,
    ) -> Self {
        let id = id.into();
        let entity_type = if group.entity_type.is_empty() {
            fallback_type.to_string()
        } else {
            group.entity_type.clone()
        };
        Self {
            entity_name: format!("{}:{}", entity_type, id),
            entity_type,
            id,
            api_key: group.api_key.clone(),
            transport: Some(group.transport.unwrap_or(fallback_transport)),
            endpoint: None,
            polling: true,
            commands: group.commands.clone(),
            active: group.active.clone(),
            static_attributes: group.static_attributes.clone(),
            service: group.service.clone(),
            subservice: group.subservice.clone(),
        }
    }
}

/// Configuration group keyed by apikey.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub api_key: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    #[serde(default)]
    pub active: Vec<ActiveAttribute>,
    #[serde(default)]
    pub static_attributes: Vec<Attribute>,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub subservice: String,
}

pub(crate) fn default_resource() -> String {
    "/iot/d".to_string()
}

impl Group {
    pub fn new(api_key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            resource: default_resource(),
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_parse_and_order() {
        assert_eq!("mqtt".parse::<Transport>().unwrap(), Transport::Mqtt);
        assert_eq!("AMQP".parse::<Transport>().unwrap(), Transport::Amqp);
        assert!("coap".parse::<Transport>().is_err());
        assert!(Transport::Http < Transport::Mqtt);
        assert!(Transport::Mqtt < Transport::Amqp);
    }

    #[test]
    fn test_command_status_terminal() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Delivered.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Error.is_terminal());
    }

    #[test]
    fn test_device_from_group() {
        let mut group = Group::new("1234", "Sensor");
        group.service = "smart".to_string();
        group.commands.push(DeviceCommand::new("ping"));

        let device = Device::from_group("dev1", &group, Transport::Mqtt, "Thing");
        assert_eq!(device.entity_name, "Sensor:dev1");
        assert_eq!(device.transport, Some(Transport::Mqtt));
        assert_eq!(device.service, "smart");
        assert!(device.command("ping").is_some());
        assert!(device.polling);
    }

    #[test]
    fn test_active_attribute_lookup_prefers_object_id() {
        let device = Device::new("dev1", "1234").with_active(ActiveAttribute {
            object_id: Some("t".to_string()),
            name: "temperature".to_string(),
            kind: "Number".to_string(),
        });
        assert_eq!(device.active_attribute("t").unwrap().name, "temperature");
        assert_eq!(
            device.active_attribute("temperature").unwrap().kind,
            "Number"
        );
        assert!(device.active_attribute("h").is_none());
    }

    #[test]
    fn test_attribute_value_text() {
        assert_eq!(Attribute::new("a", "Text", "23").value_text(), "23");
        assert_eq!(
            Attribute::new("a", "Number", serde_json::json!(23)).value_text(),
            "23"
        );
    }
}
