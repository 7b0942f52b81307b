//! Ultralight 2.0 codec.
//!
//! Pure functions over strings: nothing here performs I/O or keeps state.
//! Values stay opaque strings; type inference belongs to the context sink.

pub mod parser;
pub mod serializer;
pub mod types;

pub use parser::{
    classify_segment, is_iso8601, parse_command_invocation, parse_command_result,
    parse_configuration_request, parse_measures,
};
pub use serializer::{
    expression_context, serialize_command_list, serialize_command_payload,
    serialize_configuration_payload,
};
pub use types::{
    CodecError, CodecResult, CommandInvocation, CommandPayload, CommandResult, ConfigurationKind,
    ConfigurationRequest, EncodedPayload, MeasureGroup, PayloadType, Segment, SegmentKind,
};
