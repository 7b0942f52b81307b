//! Transport bindings for the Ultralight 2.0 gateway.
//!
//! Each binding moves Ultralight payloads between devices and the gateway
//! over one transport. The [`selector::TransportSelector`] owns the started
//! bindings and the [`gateway::Gateway`] facade routes operations to them.

pub mod amqp;
pub mod binding;
pub mod common;
pub mod gateway;
pub mod http;
pub mod mqtt;
pub mod selector;

pub use amqp::AmqpBinding;
pub use binding::{GatewayContext, TransportBinding};
pub use common::{handle_message, parse_topic, ConfigurationReply, TopicInfo, TopicSuffix};
pub use gateway::Gateway;
pub use http::{router, HttpBinding, HttpError};
pub use mqtt::MqttBinding;
pub use selector::TransportSelector;
