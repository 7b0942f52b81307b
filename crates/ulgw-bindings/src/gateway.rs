//! Gateway facade.
//!
//! Entry point for the registry and sink side: command dispatch,
//! configuration notifications, provisioning and updating.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ulgw_core::{Attribute, Device, GatewayError, GatewayResult, Transport};

use crate::binding::{GatewayContext, TransportBinding};
use crate::selector::TransportSelector;

#[derive(Clone)]
pub struct Gateway {
    ctx: GatewayContext,
    selector: Arc<TransportSelector>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Gateway {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            selector: Arc::new(TransportSelector::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    pub fn selector(&self) -> &Arc<TransportSelector> {
        &self.selector
    }

    /// Start the configured bindings and the background tasks.
    pub async fn start(&self) -> GatewayResult<()> {
        self.selector.start_transport_bindings(&self.ctx).await?;

        let mut tasks = self.tasks.lock().await;
        if let Some(receiver) = self.ctx.sink.notifications() {
            tasks.push(self.spawn_notification_forwarder(receiver));
        }
        if let Some(timeout) = self.ctx.config.commands.timeout_secs {
            let interval = Duration::from_secs(self.ctx.config.commands.sweep_interval_secs.max(1));
            info!("Commands expire after {}s without a result", timeout);
            tasks.push(
                self.ctx
                    .correlator
                    .spawn_sweeper(Duration::from_secs(timeout), interval),
            );
        }

        info!("Gateway started with {:?}", self.selector.protocols().await);
        Ok(())
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.selector.stop_transport_bindings().await;
        info!("Gateway stopped");
    }

    fn spawn_notification_forwarder(
        &self,
        mut receiver: broadcast::Receiver<ulgw_core::SinkNotification>,
    ) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        if let Err(e) = gateway
                            .notify(&notification.device, notification.values)
                            .await
                        {
                            error!(
                                code = "CONFIG-001",
                                device_id = %notification.device.id,
                                "Cannot forward notification: {}",
                                e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification forwarder skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn transport_for(&self, device: &Device) -> Transport {
        device
            .transport
            .unwrap_or(self.ctx.config.gateway.default_transport)
    }

    /// Dispatch a command to a device over its transport.
    ///
    /// The command is PENDING until the binding reports progress; a send
    /// failure moves it to ERROR.
    pub async fn command(&self, device: &Device, command: &str, value: Value) -> GatewayResult<()> {
        self.ctx
            .correlator
            .register(device, command, value.clone())
            .await?;

        let transport = self.transport_for(device);
        debug!(device_id = %device.id, command, "Dispatching command over {}", transport);
        let result = self
            .selector
            .apply_to(transport, |binding| async move {
                binding.command_handler(device, command, &value).await
            })
            .await;

        if let Err(e) = &result {
            if let Err(sink_error) = self
                .ctx
                .correlator
                .fail(device, command, &e.to_string())
                .await
            {
                error!(
                    code = "COMMANDS-003",
                    device_id = %device.id,
                    command,
                    "Cannot report command failure: {}",
                    sink_error
                );
            }
        }
        result
    }

    /// Send configuration values to a device.
    pub async fn notify(&self, device: &Device, values: Vec<Attribute>) -> GatewayResult<()> {
        let transport = self.transport_for(device);
        self.selector
            .apply_to(transport, |binding| async move {
                binding.notification_handler(device, &values).await
            })
            .await
    }

    /// Let every binding adjust a new device. The first binding's version wins.
    pub async fn provision_device(&self, device: Device) -> GatewayResult<Device> {
        let devices = self
            .selector
            .apply_function_from_binding(None, |binding: Arc<dyn TransportBinding>| {
                let device = device.clone();
                async move { binding.provisioning_handler(device).await }
            })
            .await?;
        let device = devices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Configuration("no transport bindings started".into()))?;
        self.ctx.registry.create_or_find_device(device).await
    }

    /// Let every binding adjust an updated device, then store it.
    pub async fn update_device(&self, device: Device, previous: &Device) -> GatewayResult<Device> {
        let devices = self
            .selector
            .apply_function_from_binding(None, |binding: Arc<dyn TransportBinding>| {
                let device = device.clone();
                async move { binding.updating_handler(device, previous).await }
            })
            .await?;
        let device = devices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Configuration("no transport bindings started".into()))?;
        self.ctx.registry.update_device(device).await
    }
}
