//! Ultralight 2.0 decoding.
//!
//! Measures: `[timestamp|]name|value[|name|value...]`, groups joined by `#`.
//! Commands and results: `deviceId@command[|...]`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use ulgw_core::TIME_INSTANT;

use crate::types::{
    CodecError, CodecResult, CommandInvocation, CommandPayload, CommandResult, ConfigurationKind,
    ConfigurationRequest, MeasureGroup, Segment, SegmentKind,
};

const GROUP_SEPARATOR: char = '#';
const FIELD_SEPARATOR: char = '|';
const COMMAND_SEPARATOR: char = '@';

fn parse_error(msg: impl Into<String>) -> CodecError {
    CodecError::Parse(msg.into())
}

/// Decide whether a group is a command result or a measure group.
///
/// An `@` in the first field makes it a command result; anything else is a
/// measure group.
pub fn classify_segment(group: &str) -> SegmentKind {
    let head = group.split(FIELD_SEPARATOR).next().unwrap_or_default();
    if head.contains(COMMAND_SEPARATOR) {
        SegmentKind::CommandResult
    } else {
        SegmentKind::Measure
    }
}

/// Decode a measures payload. Fails as a whole on the first bad group.
pub fn parse_measures(payload: Option<&str>) -> CodecResult<Vec<Segment>> {
    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| parse_error("empty payload"))?;

    payload
        .split(GROUP_SEPARATOR)
        .map(|group| {
            if group.is_empty() {
                return Err(parse_error(format!("empty measure group in '{}'", payload)));
            }
            match classify_segment(group) {
                SegmentKind::CommandResult => parse_command_result(group).map(Segment::CommandResult),
                SegmentKind::Measure => parse_measure_group(group).map(Segment::Measure),
            }
        })
        .collect()
}

fn parse_measure_group(group: &str) -> CodecResult<MeasureGroup> {
    let body = group.strip_prefix(FIELD_SEPARATOR).unwrap_or(group);
    let tokens: Vec<&str> = body.split(FIELD_SEPARATOR).collect();

    if tokens.iter().any(|t| t.is_empty()) {
        return Err(parse_error(format!("empty token in measure group '{}'", group)));
    }

    let mut measures = MeasureGroup::new();
    let pairs = if tokens.len() % 2 == 1 {
        let timestamp = tokens[0];
        if !is_iso8601(timestamp) {
            return Err(parse_error(format!(
                "odd number of fields and '{}' is not a timestamp",
                timestamp
            )));
        }
        measures.push(TIME_INSTANT, timestamp);
        &tokens[1..]
    } else {
        &tokens[..]
    };

    if pairs.is_empty() {
        return Err(parse_error(format!("no measures in group '{}'", group)));
    }

    for pair in pairs.chunks_exact(2) {
        measures.push(pair[0], pair[1]);
    }
    Ok(measures)
}

/// Check a measure timestamp against the usual ISO 8601 shapes.
pub fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn split_command_head(head: &str) -> CodecResult<(String, String)> {
    let parts: Vec<&str> = head.split(COMMAND_SEPARATOR).collect();
    match parts.as_slice() {
        [device_id, command] if !device_id.is_empty() && !command.is_empty() => {
            Ok((device_id.to_string(), command.to_string()))
        }
        _ => Err(parse_error(format!(
            "'{}' is not of the form deviceId@command",
            head
        ))),
    }
}

/// Decode `deviceId@command[|value]` or `deviceId@command|k=v|...`.
pub fn parse_command_invocation(payload: &str) -> CodecResult<CommandInvocation> {
    let mut fields = payload.split(FIELD_SEPARATOR);
    let (device_id, command) = split_command_head(fields.next().unwrap_or_default())?;
    let rest: Vec<&str> = fields.collect();

    let payload = match rest.as_slice() {
        [] => CommandPayload::None,
        [single] if !single.contains('=') => CommandPayload::Value(single.to_string()),
        tokens => {
            let params = tokens
                .iter()
                .map(|token| {
                    token
                        .split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .ok_or_else(|| {
                            parse_error(format!("command parameter '{}' lacks '='", token))
                        })
                })
                .collect::<CodecResult<Vec<_>>>()?;
            CommandPayload::Params(params)
        }
    };

    Ok(CommandInvocation {
        device_id,
        command,
        payload,
    })
}

/// Decode `deviceId@command|result`.
pub fn parse_command_result(payload: &str) -> CodecResult<CommandResult> {
    let mut fields = payload.split(FIELD_SEPARATOR);
    let (device_id, command) = split_command_head(fields.next().unwrap_or_default())?;
    let result = fields.next().unwrap_or_default().to_string();

    Ok(CommandResult {
        device_id,
        command,
        result,
    })
}

/// Decode `type|attr1|attr2...`.
pub fn parse_configuration_request(payload: &str) -> CodecResult<ConfigurationRequest> {
    if payload.is_empty() {
        return Err(parse_error("empty configuration request"));
    }
    let mut fields = payload.split(FIELD_SEPARATOR);
    let kind = match fields.next().unwrap_or_default() {
        "configuration" => ConfigurationKind::Configuration,
        "subscription" => ConfigurationKind::Subscription,
        other => ConfigurationKind::Other(other.to_string()),
    };

    Ok(ConfigurationRequest {
        kind,
        attributes: fields.map(str::to_string).collect(),
    })
}
