//! Envelope serialization.
//!
//! Two JSON shapes are understood:
//!
//! - **V2** (`vsn=2.0.0`): `[join_ref, ref, topic, event, payload]`
//! - **V1** (`vsn=1.0.0`): `{"topic", "event", "payload", "ref", "join_ref"}`
//!
//! Encoding follows the configured [`WireFormat`]. Decoding accepts either
//! shape so a server that answers in the other form is still understood.

use crate::error::{ChannelError, Result};
use crate::message::Envelope;
use crate::transport::Frame;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope encoding used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Object envelopes
    V1,
    /// Array envelopes
    #[default]
    V2,
}

impl WireFormat {
    /// Protocol version advertised in the connect URL
    pub const fn vsn(self) -> &'static str {
        match self {
            Self::V1 => "1.0.0",
            Self::V2 => "2.0.0",
        }
    }
}

/// Encoder/decoder for envelopes
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: WireFormat,
}

impl Codec {
    /// Create a codec that encodes in `format`
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Encoding in use
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode an envelope as a text frame
    pub fn encode(&self, envelope: &Envelope) -> Frame {
        let reference = optional_string(envelope.reference.as_deref());
        let join_ref = optional_string(envelope.join_ref.as_deref());

        let value = match self.format {
            WireFormat::V2 => Value::Array(vec![
                join_ref,
                reference,
                Value::String(envelope.topic.clone()),
                Value::String(envelope.event.clone()),
                envelope.payload.clone(),
            ]),
            WireFormat::V1 => {
                let mut object = Map::new();
                object.insert("topic".to_owned(), Value::String(envelope.topic.clone()));
                object.insert("event".to_owned(), Value::String(envelope.event.clone()));
                object.insert("payload".to_owned(), envelope.payload.clone());
                object.insert("ref".to_owned(), reference);
                object.insert("join_ref".to_owned(), join_ref);
                Value::Object(object)
            }
        };

        Frame::Text(value.to_string())
    }

    /// Decode a frame into an envelope
    pub fn decode(&self, frame: &Frame) -> Result<Envelope> {
        let value: Value = match frame {
            Frame::Text(text) => serde_json::from_str(text),
            Frame::Binary(bytes) => serde_json::from_slice(bytes),
        }
        .map_err(|e| ChannelError::decode(format!("invalid JSON: {e}")))?;

        match value {
            Value::Array(items) => decode_array(items),
            Value::Object(object) => decode_object(object),
            other => Err(ChannelError::decode(format!(
                "expected an array or object envelope, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn decode_array(items: Vec<Value>) -> Result<Envelope> {
    let [join_ref, reference, topic, event, payload]: [Value; 5] =
        items.try_into().map_err(|items: Vec<Value>| {
            ChannelError::decode(format!(
                "array envelope must have 5 elements, got {}",
                items.len()
            ))
        })?;

    Ok(Envelope {
        topic: required_string(topic, "topic")?,
        event: required_string(event, "event")?,
        payload,
        reference: nullable_string(reference, "ref")?,
        join_ref: nullable_string(join_ref, "join_ref")?,
    })
}

fn decode_object(object: Map<String, Value>) -> Result<Envelope> {
    serde_json::from_value(Value::Object(object))
        .map_err(|e| ChannelError::decode(format!("invalid object envelope: {e}")))
}

fn required_string(value: Value, field: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ChannelError::decode(format!(
            "{field} must be a string, got {}",
            json_kind(&other)
        ))),
    }
}

fn nullable_string(value: Value, field: &str) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(ChannelError::decode(format!(
            "{field} must be a string or null, got {}",
            json_kind(&other)
        ))),
    }
}

fn optional_string(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::String(s.to_owned()))
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use insta::assert_snapshot;
    use proptest::prelude::*;
    use serde_json::json;

    fn text(frame: &Frame) -> &str {
        match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => "<binary>",
        }
    }

    #[test]
    fn test_v2_join_encoding() {
        let codec = Codec::new(WireFormat::V2);
        let frame = codec.encode(&Envelope::join("agents:lobby", json!({}), 1));
        assert_snapshot!(text(&frame), @r#"["1","1","agents:lobby","phx_join",{}]"#);
    }

    #[test]
    fn test_v2_heartbeat_encoding() {
        let codec = Codec::new(WireFormat::V2);
        let frame = codec.encode(&Envelope::heartbeat(12));
        assert_snapshot!(text(&frame), @r#"[null,"12","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn test_v1_encoding_uses_object_shape() {
        let codec = Codec::new(WireFormat::V1);
        let frame = codec.encode(&Envelope::join("agents:lobby", json!({"nick": "a"}), 4));
        assert_snapshot!(
            text(&frame),
            @r#"{"event":"phx_join","join_ref":"4","payload":{"nick":"a"},"ref":"4","topic":"agents:lobby"}"#
        );
    }

    #[test]
    fn test_decode_server_reply() {
        let codec = Codec::default();
        let frame = Frame::Text(
            r#"["1","1","agents:lobby","phx_reply",{"status":"ok","response":{}}]"#.to_owned(),
        );
        let envelope = codec.decode(&frame).expect("valid reply");
        assert_eq!(envelope.topic, "agents:lobby");
        assert_eq!(envelope.event, "phx_reply");
        assert_eq!(envelope.reference_id(), Some(1));
        assert_eq!(envelope.join_ref_id(), Some(1));
        assert_eq!(envelope.payload, json!({"status": "ok", "response": {}}));
    }

    #[test]
    fn test_decode_broadcast_without_refs() {
        let codec = Codec::default();
        let frame = Frame::Text(r#"[null,null,"room:1","new_msg",{"body":"hi"}]"#.to_owned());
        let envelope = codec.decode(&frame).expect("valid broadcast");
        assert_eq!(envelope.reference, None);
        assert_eq!(envelope.join_ref, None);
    }

    #[test]
    fn test_decode_v1_object_and_binary_frames() {
        let codec = Codec::new(WireFormat::V2);
        let frame = Frame::Binary(
            br#"{"topic":"room:1","event":"new_msg","payload":{"n":1},"ref":null}"#.to_vec(),
        );
        let envelope = codec.decode(&frame).expect("valid v1 envelope");
        assert_eq!(envelope.topic, "room:1");
        assert_eq!(envelope.payload, json!({"n": 1}));
        assert_eq!(envelope.join_ref, None);
    }

    #[test]
    fn test_decode_v1_object_defaults_missing_fields() {
        let codec = Codec::default();
        let frame = Frame::Text(r#"{"topic":"room:1","event":"presence","extra":1}"#.to_owned());
        let envelope = codec.decode(&frame).expect("fields beyond topic and event are optional");
        assert_eq!(
            envelope,
            Envelope::new("room:1", "presence", Value::Null, None, None)
        );

        let frame = Frame::Text(r#"{"topic":"room:1","event":"x","ref":3}"#.to_owned());
        assert!(matches!(codec.decode(&frame), Err(ChannelError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        let codec = Codec::default();
        let cases = [
            "not json",
            "42",
            r#"["1","1","topic","event"]"#,
            r#"["1","1",7,"event",{}]"#,
            r#"["1",2,"topic","event",{}]"#,
            r#"{"event":"x","payload":{}}"#,
        ];

        for case in cases {
            let result = codec.decode(&Frame::Text(case.to_owned()));
            assert!(
                matches!(result, Err(ChannelError::Decode(_))),
                "expected decode error for {case}"
            );
        }
    }

    proptest! {
        #[test]
        fn decode_never_panics(input in ".*") {
            let _ = Codec::default().decode(&Frame::Text(input));
        }

        #[test]
        fn v2_encoding_preserves_routing_fields(
            topic in "[a-z]{1,8}:[a-z0-9]{1,8}",
            event in "[a-z_]{1,12}",
            reference in proptest::option::of(any::<u64>()),
            join_ref in proptest::option::of(any::<u64>()),
            body in ".{0,16}",
        ) {
            let codec = Codec::new(WireFormat::V2);
            let envelope = Envelope::new(topic, event, json!({ "body": body }), reference, join_ref);
            let decoded = codec.decode(&codec.encode(&envelope)).expect("encoded envelope decodes");
            prop_assert_eq!(decoded, envelope);
        }
    }
}
