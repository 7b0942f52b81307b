//! Ultralight 2.0 encoding of commands and configuration replies.

use serde_json::{json, Map, Value};
use ulgw_core::{Attribute, Device, ExpressionEvaluator};

use crate::types::{CodecError, CodecResult, EncodedPayload, PayloadType};

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `deviceId@command` followed by the command arguments.
fn format_invocation(device_id: &str, command: &str, value: &Value) -> String {
    let mut line = format!("{}@{}", device_id, command);
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                line.push('|');
                line.push_str(k);
                line.push('=');
                line.push_str(&value_text(v));
            }
        }
        scalar => {
            line.push('|');
            line.push_str(&value_text(scalar));
        }
    }
    line
}

/// Context handed to command expressions.
pub fn expression_context(device: &Device, attributes: &Value) -> Value {
    let static_attributes: Map<String, Value> = device
        .static_attributes
        .iter()
        .map(|a| (a.name.clone(), a.value.clone()))
        .collect();

    let mut context = json!({
        "id": device.id,
        "type": device.entity_type,
        "service": device.service,
        "subservice": device.subservice,
        "staticAttributes": static_attributes,
    });
    if let (Value::Object(ctx), Value::Object(attrs)) = (&mut context, attributes) {
        for (k, v) in attrs {
            ctx.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    context
}

/// Encode a command for a device.
///
/// When the device declares an expression for the command, its result is
/// sent instead of `attributes`. The declared payload type decides the
/// wire body; binary and JSON bodies carry the command value alone.
pub fn serialize_command_payload(
    device: &Device,
    command: &str,
    attributes: &Value,
    evaluator: &dyn ExpressionEvaluator,
) -> CodecResult<EncodedPayload> {
    let declared = device.command(command);

    let value = match declared.and_then(|c| c.expression.as_deref()) {
        Some(expression) => {
            let context = expression_context(device, attributes);
            evaluator
                .evaluate(expression, &context)
                .map_err(CodecError::Expression)?
        }
        None => attributes.clone(),
    };

    let text = format_invocation(&device.id, command, &value);
    let payload_type = PayloadType::from_declared(declared.and_then(|c| c.payload_type.as_deref()));
    let body = match payload_type {
        PayloadType::BinaryFromString => value_text(&value).into_bytes(),
        PayloadType::BinaryFromHex => hex::decode(value_text(&value))
            .map_err(|e| CodecError::Encoding(format!("invalid hex command value: {}", e)))?,
        PayloadType::BinaryFromJson | PayloadType::Json => serde_json::to_vec(&value)
            .map_err(|e| CodecError::Encoding(e.to_string()))?,
        PayloadType::Text => text.clone().into_bytes(),
    };

    Ok(EncodedPayload {
        text,
        body,
        content_type: payload_type.content_type(),
    })
}

/// `deviceId@configuration|k1=v1|...` in the given order.
pub fn serialize_configuration_payload(device_id: &str, attributes: &[Attribute]) -> String {
    let mut line = format!("{}@configuration", device_id);
    for attr in attributes {
        line.push('|');
        line.push_str(&attr.name);
        line.push('=');
        line.push_str(&attr.value_text());
    }
    line
}

/// Join queued command lines for a polling device.
pub fn serialize_command_list<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulgw_core::{DeviceCommand, NoExpressions};

    fn device() -> Device {
        Device::new("dev1", "1234")
            .with_entity("Sensor:dev1", "Sensor")
            .with_command(DeviceCommand::new("ping"))
    }

    #[test]
    fn test_mapping_attributes() {
        let payload = serialize_command_payload(
            &device(),
            "ping",
            &json!({"a": "1", "b": 2}),
            &NoExpressions,
        )
        .unwrap();
        assert_eq!(payload.text, "dev1@ping|a=1|b=2");
        assert_eq!(payload.body, b"dev1@ping|a=1|b=2".to_vec());
        assert_eq!(payload.content_type, "text/plain");
    }

    #[test]
    fn test_scalar_attribute() {
        let payload =
            serialize_command_payload(&device(), "ping", &json!("theValue"), &NoExpressions)
                .unwrap();
        assert_eq!(payload.text, "dev1@ping|theValue");
    }

    #[test]
    fn test_no_arguments() {
        let payload =
            serialize_command_payload(&device(), "ping", &Value::Null, &NoExpressions).unwrap();
        assert_eq!(payload.text, "dev1@ping");
    }

    #[test]
    fn test_expression_replaces_attributes() {
        let device = Device::new("dev1", "1234")
            .with_service("smart", "/gardens")
            .with_command(DeviceCommand::new("set").with_expression("level * 2"));

        let evaluator = |expr: &str, ctx: &Value| -> Result<Value, String> {
            assert_eq!(expr, "level * 2");
            assert_eq!(ctx["service"], "smart");
            let level = ctx["level"].as_i64().ok_or("missing level")?;
            Ok(json!(level * 2))
        };

        let payload =
            serialize_command_payload(&device, "set", &json!({"level": 21}), &evaluator).unwrap();
        assert_eq!(payload.text, "dev1@set|42");
    }

    #[test]
    fn test_expression_failure() {
        let device = Device::new("dev1", "1234")
            .with_command(DeviceCommand::new("set").with_expression("x"));
        let result = serialize_command_payload(&device, "set", &json!("1"), &NoExpressions);
        assert!(matches!(result, Err(CodecError::Expression(_))));
    }

    #[test]
    fn test_payload_types() {
        let device = Device::new("dev1", "1234")
            .with_command(DeviceCommand::new("raw").with_payload_type("binaryFromString"))
            .with_command(DeviceCommand::new("hex").with_payload_type("binaryfromhex"))
            .with_command(DeviceCommand::new("bjson").with_payload_type("binaryFromJson"))
            .with_command(DeviceCommand::new("js").with_payload_type("json"));

        let raw = serialize_command_payload(&device, "raw", &json!("abc"), &NoExpressions).unwrap();
        assert_eq!(raw.body, b"abc".to_vec());
        assert_eq!(raw.content_type, "application/octet-stream");

        let hex = serialize_command_payload(&device, "hex", &json!("0aff"), &NoExpressions).unwrap();
        assert_eq!(hex.body, vec![0x0a, 0xff]);

        let bad = serialize_command_payload(&device, "hex", &json!("zz"), &NoExpressions);
        assert!(matches!(bad, Err(CodecError::Encoding(_))));

        let bjson =
            serialize_command_payload(&device, "bjson", &json!({"a": 1}), &NoExpressions).unwrap();
        assert_eq!(bjson.body, br#"{"a":1}"#.to_vec());
        assert_eq!(bjson.content_type, "application/octet-stream");

        let js = serialize_command_payload(&device, "js", &json!({"a": 1}), &NoExpressions).unwrap();
        assert_eq!(js.content_type, "application/json");
        assert_eq!(js.text, "dev1@js|a=1");
    }

    #[test]
    fn test_configuration_payload() {
        let attrs = vec![
            Attribute::new("pressure", "Number", "20"),
            Attribute::new("dt", "DateTime", "2016-06-13T00:35:30Z"),
        ];
        assert_eq!(
            serialize_configuration_payload("dev1", &attrs),
            "dev1@configuration|pressure=20|dt=2016-06-13T00:35:30Z"
        );
    }

    #[test]
    fn test_command_list() {
        let lines = vec!["dev1@ping|1".to_string(), "dev1@reset".to_string()];
        assert_eq!(serialize_command_list(&lines), "dev1@ping|1|dev1@reset");
        assert_eq!(serialize_command_list::<String>(&[]), "");
    }
}
