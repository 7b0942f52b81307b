//! AMQP transport.
//!
//! Devices publish on a topic exchange with routing keys shaped like MQTT
//! topics, dot-separated: `<apikey>.<deviceId>.attrs[.<attr>]`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ulgw_core::{AmqpConfig, Attribute, Device, GatewayError, GatewayResult, Transport};

use crate::binding::{GatewayContext, TransportBinding};
use crate::common::{configuration_payload, handle_message};

/// Routing keys bound to the gateway queue.
pub const BINDING_KEYS: [&str; 4] = [
    "#.attrs",
    "#.attrs.*",
    "#.configuration.commands",
    "#.cmdexe",
];

const CONSUMER_TAG: &str = "ulgw";

pub fn command_routing_key(api_key: &str, device_id: &str) -> String {
    format!("{}.{}.cmd", api_key, device_id)
}

pub fn configuration_routing_key(api_key: &str, device_id: &str) -> String {
    format!("{}.{}.configuration.values", api_key, device_id)
}

fn amqp_error(context: &str, e: lapin::Error) -> GatewayError {
    GatewayError::Transport(format!("{}: {}", context, e))
}

struct Session {
    connection: Connection,
    channel: Channel,
    consumer_task: JoinHandle<()>,
}

pub struct AmqpBinding {
    ctx: GatewayContext,
    config: AmqpConfig,
    session: RwLock<Option<Session>>,
}

impl AmqpBinding {
    pub fn new(ctx: GatewayContext, config: AmqpConfig) -> Self {
        Self {
            ctx,
            config,
            session: RwLock::new(None),
        }
    }

    async fn connect_with_retries(&self) -> GatewayResult<Connection> {
        let uri = self.config.uri();
        let mut attempt = 0;
        loop {
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!(
                        "AMQP connection failed ({}/{}), retrying in {}s: {}",
                        attempt, self.config.retries, self.config.retry_time, e
                    );
                    tokio::time::sleep(Duration::from_secs(self.config.retry_time)).await;
                }
                Err(e) => {
                    error!(code = "AMQP-001", "Cannot connect to AMQP broker: {}", e);
                    return Err(amqp_error("cannot connect to AMQP broker", e));
                }
            }
        }
    }

    /// Declare the exchange and queue and bind the device routing keys.
    async fn declare_topology(&self, channel: &Channel) -> GatewayResult<()> {
        let exchange = &self.config.exchange;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    // amq.* exchanges are predeclared by the broker
                    passive: exchange.starts_with("amq."),
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("exchange declare failed", e))?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: self.config.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("queue declare failed", e))?;

        for key in BINDING_KEYS {
            channel
                .queue_bind(
                    &self.config.queue,
                    exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| amqp_error("queue bind failed", e))?;
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> GatewayResult<()> {
        let session = self.session.read().await;
        let channel = &session
            .as_ref()
            .ok_or_else(|| GatewayError::Transport("AMQP binding is not started".into()))?
            .channel;
        publish_on(channel, &self.config.exchange, routing_key, payload).await
    }
}

async fn publish_on(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> GatewayResult<()> {
    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default(),
        )
        .await
        .map_err(|e| amqp_error("publish failed", e))?
        .await
        .map_err(|e| amqp_error("publish not confirmed", e))?;
    Ok(())
}

#[async_trait]
impl TransportBinding for AmqpBinding {
    fn protocol(&self) -> Transport {
        Transport::Amqp
    }

    async fn start(&self) -> GatewayResult<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }

        let connection = self.connect_with_retries().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| amqp_error("cannot open channel", e))?;
        self.declare_topology(&channel).await?;

        let mut consumer = channel
            .basic_consume(
                &self.config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("cannot consume queue", e))?;

        let ctx = self.ctx.clone();
        let reply_channel = channel.clone();
        let exchange = self.config.exchange.clone();
        let consumer_task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(code = "AMQP-002", "Consumer error: {}", e);
                        break;
                    }
                };
                let routing_key = delivery.routing_key.as_str();
                let reply =
                    handle_message(&ctx, Transport::Amqp, routing_key, '.', &delivery.data).await;
                if let Some(reply) = reply {
                    let key = configuration_routing_key(&reply.api_key, &reply.device_id);
                    if let Err(e) =
                        publish_on(&reply_channel, &exchange, &key, reply.payload.as_bytes()).await
                    {
                        error!(code = "CONFIG-001", routing_key = %key, "Cannot publish configuration: {}", e);
                    }
                }
            }
            debug!("AMQP consumer finished");
        });

        info!(
            "AMQP binding consuming {} on exchange {}",
            self.config.queue, self.config.exchange
        );
        *session = Some(Session {
            connection,
            channel,
            consumer_task,
        });
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        session.consumer_task.abort();
        if let Err(e) = session.channel.close(200, "gateway stopping").await {
            debug!("AMQP channel close: {}", e);
        }
        session
            .connection
            .close(200, "gateway stopping")
            .await
            .map_err(|e| amqp_error("connection close failed", e))?;
        info!("AMQP binding stopped");
        Ok(())
    }

    async fn command_handler(
        &self,
        device: &Device,
        command: &str,
        value: &Value,
    ) -> GatewayResult<()> {
        let encoded = self.ctx.encode_command(device, command, value)?;
        let key = command_routing_key(&device.api_key, &device.id);
        debug!(device_id = %device.id, routing_key = %key, payload = %encoded.text, "Publishing command");
        self.publish(&key, &encoded.body).await?;
        self.ctx.correlator.delivered(device, command).await
    }

    async fn notification_handler(
        &self,
        device: &Device,
        values: &[Attribute],
    ) -> GatewayResult<()> {
        let key = configuration_routing_key(&device.api_key, &device.id);
        let payload = configuration_payload(device, values);
        self.publish(&key, payload.as_bytes()).await
    }

    async fn provisioning_handler(&self, device: Device) -> GatewayResult<Device> {
        Ok(device)
    }

    async fn updating_handler(&self, device: Device, _previous: &Device) -> GatewayResult<Device> {
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{parse_topic, TopicSuffix};

    #[test]
    fn test_routing_keys() {
        assert_eq!(command_routing_key("1234", "dev1"), "1234.dev1.cmd");
        assert_eq!(
            configuration_routing_key("1234", "dev1"),
            "1234.dev1.configuration.values"
        );
    }

    #[test]
    fn test_outbound_keys_are_not_consumed() {
        // Replies must not match the bound ingestion keys
        assert!(parse_topic(&command_routing_key("1234", "dev1"), '.').is_none());
        assert!(parse_topic(&configuration_routing_key("1234", "dev1"), '.').is_none());
        assert_eq!(
            parse_topic("1234.dev1.configuration.commands", '.').map(|t| t.suffix),
            Some(TopicSuffix::ConfigurationRequest)
        );
    }
}
