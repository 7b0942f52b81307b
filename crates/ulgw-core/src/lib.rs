//! Core types for the Ultralight 2.0 gateway.
//!
//! - [`device`]: devices, groups, attributes and the transport enum
//! - [`collaborators`]: registry, sink, command store and evaluator traits
//! - [`config`]: TOML configuration with environment overrides
//! - [`memory`]: in-memory collaborators
//! - [`error`]: the error taxonomy

pub mod collaborators;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;

pub use collaborators::{
    retrieve_device, CommandStore, ContextSink, DeviceRegistry, ExpressionEvaluator,
    NoExpressions, QueuedCommand, SinkNotification,
};
pub use config::{AmqpConfig, CommandConfig, GatewayConfig, GatewaySettings, HttpConfig, MqttConfig};
pub use device::{
    ActiveAttribute, Attribute, CommandStatus, Device, DeviceCommand, Group, MqttCommandOptions,
    Transport, TIME_INSTANT,
};
pub use error::{GatewayError, GatewayResult};
pub use memory::{MemoryCommandStore, MemoryRegistry, MemorySink, SinkCall};
