//! MQTT transport.
//!
//! One broker connection per binding. The client is created in `start` and
//! dropped in `stop`. Subscriptions are renewed on every ConnAck so they
//! survive reconnections. Once the event loop gives up, the binding reports
//! itself disconnected and the next `start` opens a new session.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ulgw_core::{Attribute, Device, GatewayError, GatewayResult, MqttConfig, Transport};

use crate::binding::{GatewayContext, TransportBinding};
use crate::common::{configuration_payload, handle_message, ConfigurationReply, PROTOCOL_SEGMENT};

const TOPIC_SUFFIXES: [&str; 4] = [
    "+/+/attrs/+",
    "+/+/attrs",
    "+/+/configuration/commands",
    "+/+/cmdexe",
];

/// Every topic the binding listens on: with and without a leading slash,
/// with and without the protocol segment.
pub fn subscription_topics() -> Vec<String> {
    let protocols = [String::new(), format!("{}/", PROTOCOL_SEGMENT)];
    let mut topics = Vec::with_capacity(16);
    for slash in ["", "/"] {
        for protocol in &protocols {
            for suffix in TOPIC_SUFFIXES {
                topics.push(format!("{}{}{}", slash, protocol, suffix));
            }
        }
    }
    topics
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn topic_prefix(config: &MqttConfig) -> &'static str {
    if config.avoid_leading_slash {
        ""
    } else {
        "/"
    }
}

/// Topic commands are published on.
pub fn command_topic(config: &MqttConfig, api_key: &str, device_id: &str) -> String {
    format!("{}{}/{}/cmd", topic_prefix(config), api_key, device_id)
}

/// Topic configuration values are published on.
pub fn configuration_topic(config: &MqttConfig, api_key: &str, device_id: &str) -> String {
    format!(
        "{}{}/{}/configuration/values",
        topic_prefix(config),
        api_key,
        device_id
    )
}

struct Session {
    client: AsyncClient,
    event_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
}

pub struct MqttBinding {
    ctx: GatewayContext,
    config: MqttConfig,
    session: RwLock<Option<Session>>,
    connecting: AtomicBool,
    /// Cleared by the event loop when it gives up on the broker
    alive: Arc<AtomicBool>,
}

impl MqttBinding {
    pub fn new(ctx: GatewayContext, config: MqttConfig) -> Self {
        Self {
            ctx,
            config,
            session: RwLock::new(None),
            connecting: AtomicBool::new(false),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.session.read().await.is_some()
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ulgw-{}", Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive.max(5)));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }
        options
    }

    async fn connect(&self) -> GatewayResult<()> {
        if let Some(stale) = self.session.write().await.take() {
            debug!("Discarding MQTT session whose event loop gave up");
            stale.event_task.abort();
            stale.worker_task.abort();
        }

        let (client, eventloop) = AsyncClient::new(self.options(), 100);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let worker_task = tokio::spawn(run_worker(
            self.ctx.clone(),
            self.config.clone(),
            client.clone(),
            message_rx,
        ));
        let event_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            self.config.clone(),
            message_tx,
            ready_tx,
            self.alive.clone(),
        ));

        let ready = ready_rx.await.unwrap_or_else(|_| {
            Err(GatewayError::Transport("MQTT event loop ended before connecting".into()))
        });
        match ready {
            Ok(()) => {
                *self.session.write().await = Some(Session {
                    client,
                    event_task,
                    worker_task,
                });
                Ok(())
            }
            Err(e) => {
                event_task.abort();
                worker_task.abort();
                Err(e)
            }
        }
    }

    async fn client(&self) -> GatewayResult<AsyncClient> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("MQTT binding is not connected".into()));
        }
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| GatewayError::Transport("MQTT binding is not started".into()))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: MqttConfig,
    messages: mpsc::UnboundedSender<(String, Vec<u8>)>,
    ready: oneshot::Sender<GatewayResult<()>>,
    alive: Arc<AtomicBool>,
) {
    let mut ready = Some(ready);
    let mut failures: u32 = 0;
    let subscriptions: Vec<SubscribeFilter> = subscription_topics()
        .into_iter()
        .map(|topic| SubscribeFilter::new(topic, qos_from_level(config.qos)))
        .collect();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                alive.store(true, Ordering::SeqCst);
                info!("MQTT connected to {}:{}", config.host, config.port);
                if let Err(e) = client.try_subscribe_many(subscriptions.clone()) {
                    error!(code = "MQTT-002", "Failed to subscribe: {}", e);
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if messages
                    .send((publish.topic.clone(), publish.payload.to_vec()))
                    .is_err()
                {
                    alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                if failures > config.retries {
                    alive.store(false, Ordering::SeqCst);
                    error!(
                        code = "MQTT-001",
                        "MQTT connection lost after {} retries, giving up: {}", config.retries, e
                    );
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(GatewayError::Transport(format!(
                            "cannot connect to {}:{}: {}",
                            config.host, config.port, e
                        ))));
                    }
                    break;
                }
                warn!(
                    "MQTT error ({}/{}), retrying in {}s: {}",
                    failures, config.retries, config.retry_time, e
                );
                tokio::time::sleep(Duration::from_secs(config.retry_time)).await;
            }
        }
    }
}

/// Process incoming messages one at a time, in arrival order.
async fn run_worker(
    ctx: GatewayContext,
    config: MqttConfig,
    client: AsyncClient,
    mut messages: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
) {
    while let Some((topic, payload)) = messages.recv().await {
        let reply = handle_message(&ctx, Transport::Mqtt, &topic, '/', &payload).await;
        if let Some(ConfigurationReply {
            api_key,
            device_id,
            payload,
        }) = reply
        {
            let topic = configuration_topic(&config, &api_key, &device_id);
            if let Err(e) = client
                .publish(&topic, qos_from_level(config.qos), config.retain, payload)
                .await
            {
                error!(code = "CONFIG-001", topic = %topic, "Cannot publish configuration: {}", e);
            }
        }
    }
}

#[async_trait]
impl TransportBinding for MqttBinding {
    fn protocol(&self) -> Transport {
        Transport::Mqtt
    }

    async fn start(&self) -> GatewayResult<()> {
        if self.is_connected().await {
            return Ok(());
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Transport(
                "MQTT connection attempt already in progress".into(),
            ));
        }
        let result = self.connect().await;
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    async fn stop(&self) -> GatewayResult<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        self.alive.store(false, Ordering::SeqCst);
        if let Err(e) = session.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        session.event_task.abort();
        session.worker_task.abort();
        info!("MQTT binding stopped");
        Ok(())
    }

    async fn command_handler(
        &self,
        device: &Device,
        command: &str,
        value: &Value,
    ) -> GatewayResult<()> {
        let encoded = self.ctx.encode_command(device, command, value)?;
        let overrides = device.command(command).and_then(|c| c.mqtt.as_ref());
        let qos = overrides.and_then(|o| o.qos).unwrap_or(self.config.qos);
        let retain = overrides.and_then(|o| o.retain).unwrap_or(self.config.retain);
        let topic = command_topic(&self.config, &device.api_key, &device.id);

        debug!(device_id = %device.id, topic = %topic, payload = %encoded.text, "Publishing command");
        self.client()
            .await?
            .publish(&topic, qos_from_level(qos), retain, encoded.body)
            .await
            .map_err(|e| GatewayError::Transport(format!("cannot publish to {}: {}", topic, e)))?;

        self.ctx.correlator.delivered(device, command).await
    }

    async fn notification_handler(
        &self,
        device: &Device,
        values: &[Attribute],
    ) -> GatewayResult<()> {
        let topic = configuration_topic(&self.config, &device.api_key, &device.id);
        let payload = configuration_payload(device, values);
        self.client()
            .await?
            .publish(
                &topic,
                qos_from_level(self.config.qos),
                self.config.retain,
                payload,
            )
            .await
            .map_err(|e| GatewayError::Transport(format!("cannot publish to {}: {}", topic, e)))
    }

    async fn provisioning_handler(&self, device: Device) -> GatewayResult<Device> {
        Ok(device)
    }

    async fn updating_handler(&self, device: Device, _previous: &Device) -> GatewayResult<Device> {
        Ok(device)
    }
}
