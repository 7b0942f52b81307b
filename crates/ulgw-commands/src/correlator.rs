//! Outstanding command tracking.
//!
//! A command is registered as PENDING when the gateway dispatches it, moves
//! to DELIVERED when the transport hands it to the device, and ends as
//! COMPLETED (device reported a result) or ERROR (send failure, endpoint
//! error or expiry). Every transition is forwarded to the context sink;
//! terminal transitions drop the record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ulgw_core::{CommandStatus, ContextSink, Device, GatewayResult};

/// Message reported for commands that outlive the configured timeout.
pub const TIMEOUT_MESSAGE: &str = "Command timeout";

/// Correlation key for a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub api_key: String,
    pub device_id: String,
    pub command: String,
}

impl CommandKey {
    pub fn new(
        api_key: impl Into<String>,
        device_id: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            device_id: device_id.into(),
            command: command.into(),
        }
    }

    pub fn for_device(device: &Device, command: &str) -> Self {
        Self::new(&device.api_key, &device.id, command)
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.api_key, self.device_id, self.command)
    }
}

/// Command awaiting a device reply.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub device: Device,
    pub command: String,
    pub value: Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    registered: Instant,
}

impl PendingCommand {
    pub fn age(&self) -> Duration {
        self.registered.elapsed()
    }
}

pub struct CommandCorrelator {
    sink: Arc<dyn ContextSink>,
    outstanding: DashMap<CommandKey, PendingCommand>,
}

impl CommandCorrelator {
    pub fn new(sink: Arc<dyn ContextSink>) -> Self {
        Self {
            sink,
            outstanding: DashMap::new(),
        }
    }

    /// Record a dispatched command as PENDING.
    pub async fn register(&self, device: &Device, command: &str, value: Value) -> GatewayResult<()> {
        let key = CommandKey::for_device(device, command);
        debug!(key = %key, "Command pending");
        self.outstanding.insert(
            key,
            PendingCommand {
                device: device.clone(),
                command: command.to_string(),
                value,
                status: CommandStatus::Pending,
                created_at: Utc::now(),
                registered: Instant::now(),
            },
        );
        self.sink
            .set_command_result(device, command, "", CommandStatus::Pending)
            .await
    }

    /// The transport handed the command to the device.
    pub async fn delivered(&self, device: &Device, command: &str) -> GatewayResult<()> {
        let key = CommandKey::for_device(device, command);
        match self.outstanding.get_mut(&key) {
            Some(mut entry) => entry.status = CommandStatus::Delivered,
            None => debug!(key = %key, "Delivered command was not registered"),
        }
        self.sink
            .set_command_result(device, command, "", CommandStatus::Delivered)
            .await
    }

    /// A device reported a result. Unknown keys are still forwarded.
    pub async fn complete(&self, device: &Device, command: &str, result: &str) -> GatewayResult<()> {
        let key = CommandKey::for_device(device, command);
        if self.outstanding.remove(&key).is_none() {
            debug!(key = %key, "Result for a command issued elsewhere");
        }
        self.sink
            .set_command_result(device, command, result, CommandStatus::Completed)
            .await
    }

    /// The command failed; the message is forwarded as its result.
    pub async fn fail(&self, device: &Device, command: &str, message: &str) -> GatewayResult<()> {
        let key = CommandKey::for_device(device, command);
        self.outstanding.remove(&key);
        warn!(key = %key, error = %message, "Command failed");
        self.sink
            .set_command_result(device, command, message, CommandStatus::Error)
            .await
    }

    pub fn status(&self, key: &CommandKey) -> Option<CommandStatus> {
        self.outstanding.get(key).map(|entry| entry.status)
    }

    pub fn get(&self, key: &CommandKey) -> Option<PendingCommand> {
        self.outstanding.get(key).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Fail every record at least `max_age` old. Returns how many expired.
    pub async fn expire_older_than(&self, max_age: Duration) -> usize {
        let expired: Vec<CommandKey> = self
            .outstanding
            .iter()
            .filter(|entry| entry.age() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for key in expired {
            let Some((_, pending)) = self.outstanding.remove(&key) else {
                continue;
            };
            count += 1;
            warn!(key = %key, status = ?pending.status, "Command expired");
            if let Err(e) = self
                .sink
                .set_command_result(
                    &pending.device,
                    &pending.command,
                    TIMEOUT_MESSAGE,
                    CommandStatus::Error,
                )
                .await
            {
                warn!(key = %key, error = %e, "[COMMANDS-003] Failed to report command expiry");
            }
        }
        count
    }

    /// Periodically expire commands older than `timeout`.
    pub fn spawn_sweeper(self: &Arc<Self>, timeout: Duration, interval: Duration) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                correlator.expire_older_than(timeout).await;
            }
        })
    }
}
