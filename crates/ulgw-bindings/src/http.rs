//! HTTP transport.
//!
//! Devices report measures with `GET|POST <path>?i=<id>&k=<apikey>`. Devices
//! with an endpoint get commands pushed to it; the rest poll for them with
//! `getCmd=1`.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use ulgw_codec::{parse_command_result, parse_measures, serialize_command_list};
use ulgw_core::{
    retrieve_device, Attribute, Device, GatewayError, GatewayResult, QueuedCommand, Transport,
};

use crate::binding::{GatewayContext, TransportBinding};
use crate::common::{apply_segments, check_timestamp, configuration_payload};

/// Name and kind of the queued entry carrying configuration values for
/// polling devices. It bypasses the command lifecycle.
pub const CONFIGURATION_COMMAND: &str = "configuration";

/// Error rendered as `{"name": ..., "message": ...}`.
#[derive(Debug)]
pub struct HttpError(pub GatewayError);

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "name": self.0.name(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type Params = HashMap<String, String>;

fn mandatory<'a>(params: &'a Params, names: &[&str]) -> GatewayResult<Vec<&'a str>> {
    let missing: Vec<&str> = names
        .iter()
        .copied()
        .filter(|n| params.get(*n).map_or(true, |v| v.is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(GatewayError::MandatoryParamsNotFound(missing.join(", ")));
    }
    Ok(names.iter().map(|n| params[*n].as_str()).collect())
}

/// Router serving the measure and command result endpoints.
pub fn router(ctx: GatewayContext) -> Router {
    let path = ctx.config.http.path.clone();
    let commands_path = format!("{}/commands", path.trim_end_matches('/'));
    Router::new()
        .route(&path, get(handle_get).post(handle_post))
        .route(&commands_path, post(handle_command_result))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn handle_get(
    State(ctx): State<GatewayContext>,
    Query(params): Query<Params>,
) -> Result<String, HttpError> {
    mandatory(&params, &["i", "k", "d"])?;
    let payload = params.get("d").map(String::as_str);
    Ok(process_request(&ctx, &params, payload).await?)
}

async fn handle_post(
    State(ctx): State<GatewayContext>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: String,
) -> Result<String, HttpError> {
    mandatory(&params, &["i", "k"])?;
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("text/plain") {
        return Err(GatewayError::UnsupportedType(content_type.to_string()).into());
    }
    Ok(process_request(&ctx, &params, Some(body.as_str())).await?)
}

async fn handle_command_result(
    State(ctx): State<GatewayContext>,
    Query(params): Query<Params>,
    body: String,
) -> Result<String, HttpError> {
    let ids = mandatory(&params, &["i", "k"])?;
    let result = parse_command_result(body.trim()).map_err(GatewayError::from)?;
    let device = retrieve_device(
        ctx.registry.as_ref(),
        ids[0],
        ids[1],
        Transport::Http,
        &ctx.config.gateway,
    )
    .await?;
    ctx.correlator
        .complete(&device, &result.command, &result.result)
        .await?;
    Ok(String::new())
}

async fn process_request(
    ctx: &GatewayContext,
    params: &Params,
    payload: Option<&str>,
) -> GatewayResult<String> {
    let segments = parse_measures(payload)?;
    let timestamp = check_timestamp(params.get("t").map(String::as_str))?;

    let device_id = params.get("i").map(String::as_str).unwrap_or_default();
    let api_key = params.get("k").map(String::as_str).unwrap_or_default();
    let device = retrieve_device(
        ctx.registry.as_ref(),
        device_id,
        api_key,
        Transport::Http,
        &ctx.config.gateway,
    )
    .await?;

    if let Err(e) = apply_segments(ctx, &device, segments, timestamp).await {
        error!(code = "MEASURES-002", device_id = %device.id, "Error updating measures: {}", e);
        return Err(e);
    }

    if params.get("getCmd").map(String::as_str) == Some("1") {
        return take_pending_commands(ctx, &device).await;
    }
    Ok(String::new())
}

/// Encode and dequeue every command waiting for a polling device.
async fn take_pending_commands(ctx: &GatewayContext, device: &Device) -> GatewayResult<String> {
    let pending = ctx
        .commands
        .pending_commands(&device.api_key, &device.id)
        .await?;

    let mut lines = Vec::with_capacity(pending.len());
    for command in pending {
        ctx.commands
            .remove_command(&device.api_key, &device.id, &command.name)
            .await?;
        if command.kind == CONFIGURATION_COMMAND {
            match serde_json::from_value::<Vec<Attribute>>(command.value) {
                Ok(values) => lines.push(configuration_payload(device, &values)),
                Err(e) => {
                    warn!(code = "CONFIG-001", device_id = %device.id, "Dropping queued configuration: {}", e);
                }
            }
            continue;
        }
        match ctx.encode_command(device, &command.name, &command.value) {
            Ok(encoded) => {
                lines.push(encoded.text);
                ctx.correlator.delivered(device, &command.name).await?;
            }
            Err(e) => {
                warn!(code = "COMMANDS-002", device_id = %device.id, command = %command.name, "Cannot encode queued command: {}", e);
                ctx.correlator
                    .fail(device, &command.name, &e.to_string())
                    .await?;
            }
        }
    }
    Ok(serialize_command_list(&lines))
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct HttpBinding {
    ctx: GatewayContext,
    client: reqwest::Client,
    server: Mutex<Option<ServerHandle>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl HttpBinding {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            client: reqwest::Client::new(),
            server: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Address the server is listening on, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    async fn post_to_device(
        &self,
        endpoint: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> GatewayResult<String> {
        let mut request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(ms) = self.ctx.config.http.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::HttpCommandResponse(format!("request to {} failed: {}", endpoint, e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::HttpCommandResponse(format!(
                "{} answered with status {}",
                endpoint, status
            )));
        }
        match response.text().await {
            Ok(body) => Ok(body),
            Err(e) => {
                debug!(endpoint, "Cannot read device reply body: {}", e);
                Ok(String::new())
            }
        }
    }
}

#[async_trait]
impl TransportBinding for HttpBinding {
    fn protocol(&self) -> Transport {
        Transport::Http
    }

    async fn start(&self) -> GatewayResult<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let addr = self.ctx.config.http.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.ctx.clone());
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        });

        *self.local_addr.write().await = Some(local_addr);
        *server = Some(ServerHandle { shutdown, task });
        info!(
            "HTTP binding listening on {}{}",
            local_addr, self.ctx.config.http.path
        );
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        let Some(handle) = self.server.lock().await.take() else {
            return Ok(());
        };
        let _ = handle.shutdown.send(());
        handle
            .task
            .await
            .map_err(|e| GatewayError::Transport(format!("HTTP server task failed: {}", e)))?;
        *self.local_addr.write().await = None;
        info!("HTTP binding stopped");
        Ok(())
    }

    async fn command_handler(
        &self,
        device: &Device,
        command: &str,
        value: &Value,
    ) -> GatewayResult<()> {
        let Some(endpoint) = device.endpoint.as_deref() else {
            debug!(device_id = %device.id, command, "Queueing command for polling device");
            let kind = device
                .command(command)
                .map(|c| c.kind.clone())
                .unwrap_or_else(|| "command".to_string());
            return self
                .ctx
                .commands
                .enqueue_command(QueuedCommand {
                    api_key: device.api_key.clone(),
                    device_id: device.id.clone(),
                    name: command.to_string(),
                    kind,
                    value: value.clone(),
                })
                .await;
        };

        let encoded = self.ctx.encode_command(device, command, value)?;
        debug!(device_id = %device.id, endpoint, payload = %encoded.text, "Pushing command");
        let reply = self
            .post_to_device(endpoint, encoded.content_type, encoded.body)
            .await?;
        self.ctx.correlator.delivered(device, command).await?;

        match parse_command_result(reply.trim()) {
            Ok(result) => {
                self.ctx
                    .correlator
                    .complete(device, &result.command, &result.result)
                    .await
            }
            Err(_) => {
                debug!(device_id = %device.id, command, "Device reply carries no command result");
                Ok(())
            }
        }
    }

    async fn notification_handler(
        &self,
        device: &Device,
        values: &[Attribute],
    ) -> GatewayResult<()> {
        match device.endpoint.as_deref() {
            Some(endpoint) => {
                let payload = configuration_payload(device, values);
                self.post_to_device(endpoint, "text/plain", payload.into_bytes())
                    .await?;
                Ok(())
            }
            None => {
                // Encoded with its `dt` when the device polls
                let value = serde_json::to_value(values).map_err(|e| {
                    GatewayError::Configuration(format!("cannot queue configuration: {}", e))
                })?;
                self.ctx
                    .commands
                    .enqueue_command(QueuedCommand {
                        api_key: device.api_key.clone(),
                        device_id: device.id.clone(),
                        name: CONFIGURATION_COMMAND.to_string(),
                        kind: CONFIGURATION_COMMAND.to_string(),
                        value,
                    })
                    .await
            }
        }
    }

    async fn provisioning_handler(&self, mut device: Device) -> GatewayResult<Device> {
        device.polling = device.endpoint.is_none();
        Ok(device)
    }

    async fn updating_handler(&self, mut device: Device, previous: &Device) -> GatewayResult<Device> {
        if device.endpoint != previous.endpoint {
            info!(
                device_id = %device.id,
                "Device endpoint changed, polling = {}",
                device.endpoint.is_none()
            );
        }
        device.polling = device.endpoint.is_none();
        Ok(device)
    }
}
