//! Decoded Ultralight structures.

use serde::Serialize;
use thiserror::Error;
use ulgw_core::{GatewayError, TIME_INSTANT};

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{0}")]
    Parse(String),

    #[error("Expression evaluation failed: {0}")]
    Expression(String),

    #[error("Payload encoding failed: {0}")]
    Encoding(String),
}

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Parse(msg) => GatewayError::Parse(msg),
            other => GatewayError::Configuration(other.to_string()),
        }
    }
}

/// One `#`-delimited measure group, in wire order.
///
/// A timestamp, when present, is stored first under `TimeInstant`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeasureGroup {
    measures: Vec<(String, String)>,
}

impl MeasureGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.measures.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.measures
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.get(TIME_INSTANT)
    }

    /// Set or replace the group timestamp.
    pub fn set_timestamp(&mut self, timestamp: impl Into<String>) {
        let timestamp = timestamp.into();
        match self.measures.iter_mut().find(|(n, _)| n == TIME_INSTANT) {
            Some((_, v)) => *v = timestamp,
            None => self.measures.insert(0, (TIME_INSTANT.to_string(), timestamp)),
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.measures
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MeasureGroup {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            measures: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Completion report sent by a device for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub device_id: String,
    pub command: String,
    pub result: String,
}

/// Arguments carried by a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPayload {
    None,
    Value(String),
    Params(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInvocation {
    pub device_id: String,
    pub command: String,
    pub payload: CommandPayload,
}

/// Decoded `#` group of a measures payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Measure(MeasureGroup),
    CommandResult(CommandResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Measure,
    CommandResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConfigurationKind {
    Configuration,
    Subscription,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationRequest {
    pub kind: ConfigurationKind,
    pub attributes: Vec<String>,
}

/// Declared framing for outbound command bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    BinaryFromString,
    BinaryFromHex,
    BinaryFromJson,
    Json,
    Text,
}

impl PayloadType {
    /// Case-insensitive lookup; unknown or missing names pass text through.
    pub fn from_declared(name: Option<&str>) -> Self {
        match name.map(str::to_ascii_lowercase).as_deref() {
            Some("binaryfromstring") => Self::BinaryFromString,
            Some("binaryfromhex") => Self::BinaryFromHex,
            Some("binaryfromjson") => Self::BinaryFromJson,
            Some("json") => Self::Json,
            _ => Self::Text,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::BinaryFromString | Self::BinaryFromHex | Self::BinaryFromJson => {
                "application/octet-stream"
            }
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

/// Outbound command ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Ultralight command line
    pub text: String,
    /// Bytes to put on the wire
    pub body: Vec<u8>,
    pub content_type: &'static str,
}
