//! Envelope and reply types exchanged with the channel server

use serde::Deserialize;
use serde_json::{Map, Value};

/// Reserved event names of the channel protocol.
pub mod events {
    /// Join request sent by the client
    pub const JOIN: &str = "phx_join";
    /// Leave request sent by the client
    pub const LEAVE: &str = "phx_leave";
    /// Reply to any request carrying a `ref`
    pub const REPLY: &str = "phx_reply";
    /// Channel crashed on the server, or the transport failed locally
    pub const ERROR: &str = "phx_error";
    /// Channel closed, either by the server or after a completed leave
    pub const CLOSE: &str = "phx_close";
    /// Keepalive sent on [`HEARTBEAT_TOPIC`](super::HEARTBEAT_TOPIC)
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Topic that carries socket-level heartbeats
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// One routable message unit on the wire.
///
/// `Deserialize` reads the V1 object form; missing `payload`, `ref` and
/// `join_ref` fields decode as null.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    /// Topic the message belongs to
    pub topic: String,
    /// Event name
    pub event: String,
    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: Value,
    /// Correlation id for requests awaiting a reply
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    /// Join epoch of the channel the message belongs to
    pub join_ref: Option<String>,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: Option<u64>,
        join_ref: Option<u64>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: reference.map(|r| r.to_string()),
            join_ref: join_ref.map(|r| r.to_string()),
        }
    }

    /// Create a join request
    pub fn join(topic: &str, params: Value, join_ref: u64) -> Self {
        Self::new(topic, events::JOIN, params, Some(join_ref), Some(join_ref))
    }

    /// Create a leave request
    pub fn leave(topic: &str, reference: u64, join_ref: Option<u64>) -> Self {
        Self::new(
            topic,
            events::LEAVE,
            Value::Object(Map::new()),
            Some(reference),
            join_ref,
        )
    }

    /// Create a heartbeat message
    pub fn heartbeat(reference: u64) -> Self {
        Self::new(
            HEARTBEAT_TOPIC,
            events::HEARTBEAT,
            Value::Object(Map::new()),
            Some(reference),
            None,
        )
    }

    /// Create a reply, as a server would send it
    pub fn reply(request: &Self, status: &str, response: Value) -> Self {
        Self {
            topic: request.topic.clone(),
            event: events::REPLY.to_owned(),
            payload: serde_json::json!({ "status": status, "response": response }),
            reference: request.reference.clone(),
            join_ref: request.join_ref.clone(),
        }
    }

    /// Numeric value of `ref`, when it is one of ours
    pub fn reference_id(&self) -> Option<u64> {
        self.reference.as_deref().and_then(|r| r.parse().ok())
    }

    /// Numeric value of `join_ref`, when it is one of ours
    pub fn join_ref_id(&self) -> Option<u64> {
        self.join_ref.as_deref().and_then(|r| r.parse().ok())
    }

    /// Whether this envelope is a reply to a request
    pub fn is_reply(&self) -> bool {
        self.event == events::REPLY
    }
}

/// Outcome of a request as reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// `ok`, `error`, or any application-defined status
    pub status: String,
    /// Reply body
    pub response: Value,
}

impl Reply {
    /// Parse a `phx_reply` payload of the form `{status, response}`.
    ///
    /// A missing `response` is treated as an empty object; a missing or
    /// non-string `status` is reported as `error`.
    pub fn from_payload(payload: &Value) -> Self {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_owned();
        let response = payload
            .get("response")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        Self { status, response }
    }

    /// An `ok` reply carrying `response`
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".to_owned(),
            response,
        }
    }

    /// Whether the server accepted the request
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Human-readable failure reason: `response.reason` when it is a string,
    /// otherwise the JSON text of the response.
    pub fn reason(&self) -> String {
        match self.response.get("reason").and_then(Value::as_str) {
            Some(reason) => reason.to_owned(),
            None => self.response.to_string(),
        }
    }
}

/// A message delivered to channel event handlers
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Topic of the channel
    pub topic: String,
    /// Event name
    pub event: String,
    /// Event payload
    pub payload: Value,
    /// Request ref, when the server pushed a reply-like message
    pub reference: Option<String>,
}

impl From<Envelope> for ChannelMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            topic: envelope.topic,
            event: envelope.event,
            payload: envelope.payload,
            reference: envelope.reference,
        }
    }
}
