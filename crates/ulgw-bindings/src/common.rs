//! Ingestion shared by every transport.
//!
//! MQTT topics and AMQP routing keys have the same shape, only the
//! separator differs:
//!
//! ```text
//! [sep][ul sep]<apikey> sep <deviceId> sep attrs[ sep <attribute>]
//! [sep][ul sep]<apikey> sep <deviceId> sep configuration sep commands
//! [sep][ul sep]<apikey> sep <deviceId> sep cmdexe
//! ```

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use ulgw_codec::{
    is_iso8601, parse_command_result, parse_configuration_request, parse_measures,
    serialize_configuration_payload, ConfigurationKind, MeasureGroup, Segment,
};
use ulgw_core::{retrieve_device, Attribute, Device, GatewayError, GatewayResult, Transport};

use crate::binding::GatewayContext;

/// Optional protocol segment in front of the apikey.
pub const PROTOCOL_SEGMENT: &str = "ul";

/// Attribute appended to every configuration reply.
pub const CONFIGURATION_TIMESTAMP: &str = "dt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSuffix {
    Measures,
    SingleMeasure(String),
    ConfigurationRequest,
    CommandResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub api_key: String,
    pub device_id: String,
    pub suffix: TopicSuffix,
}

fn match_suffix(parts: &[&str]) -> Option<TopicSuffix> {
    match parts {
        ["attrs"] => Some(TopicSuffix::Measures),
        ["attrs", name] if !name.is_empty() => Some(TopicSuffix::SingleMeasure(name.to_string())),
        ["configuration", "commands"] => Some(TopicSuffix::ConfigurationRequest),
        ["cmdexe"] => Some(TopicSuffix::CommandResult),
        _ => None,
    }
}

fn topic_info(api_key: &str, device_id: &str, rest: &[&str]) -> Option<TopicInfo> {
    if api_key.is_empty() || device_id.is_empty() {
        return None;
    }
    Some(TopicInfo {
        api_key: api_key.to_string(),
        device_id: device_id.to_string(),
        suffix: match_suffix(rest)?,
    })
}

/// Split a topic or routing key into apikey, device id and suffix.
pub fn parse_topic(path: &str, separator: char) -> Option<TopicInfo> {
    let trimmed = path.strip_prefix(separator).unwrap_or(path);
    let parts: Vec<&str> = trimmed.split(separator).collect();

    if parts.len() >= 4 && parts[0] == PROTOCOL_SEGMENT {
        if let Some(info) = topic_info(parts[1], parts[2], &parts[3..]) {
            return Some(info);
        }
    }
    if parts.len() >= 3 {
        return topic_info(parts[0], parts[1], &parts[2..]);
    }
    None
}

/// Configuration values to send back to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationReply {
    pub api_key: String,
    pub device_id: String,
    pub payload: String,
}

/// `deviceId@configuration|...|dt=<now>`
pub fn configuration_payload(device: &Device, values: &[Attribute]) -> String {
    let mut values = values.to_vec();
    values.push(Attribute::new(
        CONFIGURATION_TIMESTAMP,
        "DateTime",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    ));
    serialize_configuration_payload(&device.id, &values)
}

/// Canonical attributes for one measure group.
pub fn measure_attributes(ctx: &GatewayContext, device: &Device, group: &MeasureGroup) -> Vec<Attribute> {
    group
        .pairs()
        .iter()
        .map(|(name, value)| single_attribute(ctx, device, name, value))
        .collect()
}

fn single_attribute(ctx: &GatewayContext, device: &Device, name: &str, value: &str) -> Attribute {
    let mapped = device
        .active_attribute(name)
        .map(|a| a.name.clone())
        .unwrap_or_else(|| name.to_string());
    Attribute::new(
        mapped,
        ctx.sink.guess_attribute_type(name, device),
        Value::String(value.to_string()),
    )
}

/// Apply decoded segments in order: one sink update per measure group,
/// command results to the correlator.
pub async fn apply_segments(
    ctx: &GatewayContext,
    device: &Device,
    segments: Vec<Segment>,
    timestamp: Option<&str>,
) -> GatewayResult<()> {
    for segment in segments {
        match segment {
            Segment::Measure(mut group) => {
                if let Some(ts) = timestamp {
                    group.set_timestamp(ts);
                }
                let attributes = measure_attributes(ctx, device, &group);
                ctx.sink.update_attributes(device, attributes).await?;
            }
            Segment::CommandResult(result) => {
                ctx.correlator
                    .complete(device, &result.command, &result.result)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Validate an externally supplied measure timestamp.
pub fn check_timestamp(timestamp: Option<&str>) -> GatewayResult<Option<&str>> {
    match timestamp {
        Some(ts) if !is_iso8601(ts) => Err(GatewayError::Parse(format!(
            "'{}' is not an ISO 8601 timestamp",
            ts
        ))),
        other => Ok(other),
    }
}

/// Answer a `configuration|...` or `subscription|...` request.
pub async fn process_configuration_request(
    ctx: &GatewayContext,
    device: &Device,
    payload: &str,
) -> GatewayResult<Option<String>> {
    let request = parse_configuration_request(payload)?;
    match request.kind {
        ConfigurationKind::Configuration => {
            let values = ctx.sink.query_attributes(device, &request.attributes).await?;
            Ok(Some(configuration_payload(device, &values)))
        }
        ConfigurationKind::Subscription => {
            ctx.sink.subscribe(device, &request.attributes).await?;
            Ok(None)
        }
        ConfigurationKind::Other(kind) => {
            warn!(
                code = "CONFIG-002",
                device_id = %device.id,
                "Ignoring configuration request of unknown type '{}'",
                kind
            );
            Ok(None)
        }
    }
}

/// Route one broker message. Errors are logged and the message dropped.
pub async fn handle_message(
    ctx: &GatewayContext,
    transport: Transport,
    path: &str,
    separator: char,
    payload: &[u8],
) -> Option<ConfigurationReply> {
    let Some(topic) = parse_topic(path, separator) else {
        warn!(code = "MEASURES-003", topic = %path, "Message on unrecognized topic");
        return None;
    };

    let payload = match std::str::from_utf8(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(code = "MEASURES-003", topic = %path, "Payload is not UTF-8: {}", e);
            return None;
        }
    };

    let device = match retrieve_device(
        ctx.registry.as_ref(),
        &topic.device_id,
        &topic.api_key,
        transport,
        &ctx.config.gateway,
    )
    .await
    {
        Ok(device) => device,
        Err(e) => {
            error!(
                code = "MEASURES-001",
                device_id = %topic.device_id,
                api_key = %topic.api_key,
                "Device not found or provisioning failed: {}",
                e
            );
            return None;
        }
    };

    debug!(device_id = %device.id, topic = %path, "Processing {} message", transport);

    match topic.suffix {
        TopicSuffix::Measures => {
            let segments = match parse_measures(Some(payload)) {
                Ok(segments) => segments,
                Err(e) => {
                    warn!(code = "MEASURES-004", device_id = %device.id, "Dropping payload: {}", e);
                    return None;
                }
            };
            if let Err(e) = apply_segments(ctx, &device, segments, None).await {
                error!(code = "MEASURES-002", device_id = %device.id, "Error updating measures: {}", e);
            }
            None
        }
        TopicSuffix::SingleMeasure(name) => {
            let attribute = single_attribute(ctx, &device, &name, payload);
            if let Err(e) = ctx.sink.update_attributes(&device, vec![attribute]).await {
                error!(code = "MEASURES-002", device_id = %device.id, "Error updating measure: {}", e);
            }
            None
        }
        TopicSuffix::CommandResult => {
            let result = match parse_command_result(payload) {
                Ok(result) => result,
                Err(e) => {
                    warn!(code = "COMMANDS-001", device_id = %device.id, "Bad command result: {}", e);
                    return None;
                }
            };
            if let Err(e) = ctx
                .correlator
                .complete(&device, &result.command, &result.result)
                .await
            {
                error!(code = "COMMANDS-002", device_id = %device.id, "Error reporting command result: {}", e);
            }
            None
        }
        TopicSuffix::ConfigurationRequest => {
            match process_configuration_request(ctx, &device, payload).await {
                Ok(reply) => reply.map(|payload| ConfigurationReply {
                    api_key: topic.api_key,
                    device_id: topic.device_id,
                    payload,
                }),
                Err(e) => {
                    error!(code = "CONFIG-001", device_id = %device.id, "Error processing configuration request: {}", e);
                    None
                }
            }
        }
    }
}
