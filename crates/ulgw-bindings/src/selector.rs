//! Transport selector.
//!
//! Owns the started bindings, keyed by transport, and routes operations to
//! one of them or to all of them.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use ulgw_core::{GatewayError, GatewayResult, Transport};

use crate::amqp::AmqpBinding;
use crate::binding::{GatewayContext, TransportBinding};
use crate::http::HttpBinding;
use crate::mqtt::MqttBinding;

#[derive(Default)]
pub struct TransportSelector {
    bindings: RwLock<BTreeMap<Transport, Arc<dyn TransportBinding>>>,
}

impl TransportSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a started binding, replacing any binding for the same transport.
    pub async fn register(&self, binding: Arc<dyn TransportBinding>) {
        self.bindings.write().await.insert(binding.protocol(), binding);
    }

    pub async fn get(&self, protocol: Transport) -> Option<Arc<dyn TransportBinding>> {
        self.bindings.read().await.get(&protocol).cloned()
    }

    pub async fn protocols(&self) -> Vec<Transport> {
        self.bindings.read().await.keys().copied().collect()
    }

    /// Run `f` on one binding, or on every binding when `protocol` is `None`.
    ///
    /// Broadcast calls run concurrently; results come back in transport
    /// order and the call fails if any binding fails.
    pub async fn apply_function_from_binding<T, F, Fut>(
        &self,
        protocol: Option<Transport>,
        f: F,
    ) -> GatewayResult<Vec<T>>
    where
        F: Fn(Arc<dyn TransportBinding>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        match protocol {
            Some(protocol) => Ok(vec![self.apply_to(protocol, f).await?]),
            None => {
                let bindings: Vec<Arc<dyn TransportBinding>> =
                    self.bindings.read().await.values().cloned().collect();
                join_all(bindings.into_iter().map(&f))
                    .await
                    .into_iter()
                    .collect()
            }
        }
    }

    /// Run `f` on the binding for `protocol`.
    pub async fn apply_to<T, F, Fut>(&self, protocol: Transport, f: F) -> GatewayResult<T>
    where
        F: FnOnce(Arc<dyn TransportBinding>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let binding = self.get(protocol).await.ok_or_else(|| {
            GatewayError::Configuration(format!("no binding started for transport {}", protocol))
        })?;
        f(binding).await
    }

    /// Start the given bindings concurrently and register those that start.
    ///
    /// Returns the first failure after every binding has been tried.
    pub async fn start_bindings(&self, bindings: Vec<Arc<dyn TransportBinding>>) -> GatewayResult<()> {
        let results = join_all(bindings.iter().map(|b| b.start())).await;

        let mut first_error = None;
        for (binding, result) in bindings.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!("{} binding started", binding.protocol());
                    self.register(binding).await;
                }
                Err(e) => {
                    error!("{} binding failed to start: {}", binding.protocol(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Build and start the bindings the configuration asks for.
    ///
    /// HTTP always runs; MQTT and AMQP only when their section is present.
    pub async fn start_transport_bindings(&self, ctx: &GatewayContext) -> GatewayResult<()> {
        let mut bindings: Vec<Arc<dyn TransportBinding>> =
            vec![Arc::new(HttpBinding::new(ctx.clone()))];
        if let Some(mqtt) = &ctx.config.mqtt {
            bindings.push(Arc::new(MqttBinding::new(ctx.clone(), mqtt.clone())));
        }
        if let Some(amqp) = &ctx.config.amqp {
            bindings.push(Arc::new(AmqpBinding::new(ctx.clone(), amqp.clone())));
        }
        self.start_bindings(bindings).await
    }

    /// Stop every binding. Failures are logged; the registry is always cleared.
    pub async fn stop_transport_bindings(&self) {
        let bindings: Vec<Arc<dyn TransportBinding>> = {
            let mut registry = self.bindings.write().await;
            std::mem::take(&mut *registry).into_values().collect()
        };
        let results = join_all(bindings.iter().map(|b| b.stop())).await;
        for (binding, result) in bindings.iter().zip(results) {
            if let Err(e) = result {
                warn!("Error stopping {} binding: {}", binding.protocol(), e);
            }
        }
    }
}
