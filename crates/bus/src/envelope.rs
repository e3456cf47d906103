use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use alicia_core::{epoch_secs, ErrorKind};

/// Wire-format envelope wrapped around every bus payload.
///
/// Envelopes are serialized as JSON. The `message_id` enables duplicate
/// suppression and request/response correlation; `ttl_seconds` bounds how
/// long a message stays deliverable; `routing` caps relay depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique, opaque message identifier.
    pub message_id: String,

    /// Wall-clock creation time, fractional epoch seconds.
    pub timestamp: f64,

    /// Name of the publishing service.
    pub source: String,

    /// Target service name, or "broadcast".
    pub destination: String,

    pub message_type: MessageType,

    #[serde(default)]
    pub priority: Priority,

    /// Seconds until the message expires (default 300).
    #[serde(default = "default_ttl")]
    pub ttl_seconds: f64,

    /// Opaque payload, decoded per-topic at the handler boundary.
    pub payload: Value,

    #[serde(default)]
    pub routing: Routing,
}

fn default_ttl() -> f64 {
    300.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Event,
    Request,
    Response,
    Error,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Relay bookkeeping: `hops` is incremented at each relay and messages are
/// dropped once it exceeds `max_hops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub hops: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

fn default_max_hops() -> u32 {
    10
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            hops: 0,
            max_hops: default_max_hops(),
        }
    }
}

impl Envelope {
    /// Create a fresh envelope with a new `message_id` and current timestamp.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            timestamp: epoch_secs(),
            source: source.into(),
            destination: destination.into(),
            message_type,
            priority: Priority::Normal,
            ttl_seconds: default_ttl(),
            payload,
            routing: Routing::default(),
        }
    }

    /// Create a broadcast event, the most common publish shape.
    pub fn event(source: impl Into<String>, payload: Value) -> Self {
        Self::new(source, "broadcast", MessageType::Event, payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: f64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Build a response addressed back at this envelope's source.
    ///
    /// The reply payload should carry whatever the operation returns; the
    /// original `message_id` is attached for correlation.
    pub fn reply(&self, source: impl Into<String>, mut payload: Value) -> Envelope {
        if let Value::Object(map) = &mut payload {
            map.insert("request_id".into(), Value::String(self.message_id.clone()));
        }
        Envelope::new(source, self.source.clone(), MessageType::Response, payload)
    }

    /// Build an error envelope addressed back at this envelope's source,
    /// carrying the failing kind and the original request payload.
    pub fn error_reply(
        &self,
        source: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Envelope {
        let payload = serde_json::json!({
            "error": error.into(),
            "error_kind": kind.as_str(),
            "request_id": self.message_id,
            "original_request": self.payload,
        });
        Envelope::new(source, self.source.clone(), MessageType::Error, payload)
    }

    /// Whether the message has outlived its TTL at the given receive time.
    pub fn is_expired(&self, now: f64) -> bool {
        self.timestamp + self.ttl_seconds < now
    }

    /// Increment the hop counter for a relay. Returns `false` when the
    /// message has exceeded `max_hops` and must be dropped instead.
    pub fn next_hop(&mut self) -> bool {
        self.routing.hops += 1;
        self.routing.hops <= self.routing.max_hops
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_envelope_bytes() {
        let env = Envelope::new(
            "tts_service",
            "broadcast",
            MessageType::Event,
            serde_json::json!({"text": "hello"}),
        );
        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.message_id, env.message_id);
        assert_eq!(decoded.source, "tts_service");
        assert_eq!(decoded.message_type, MessageType::Event);
        assert_eq!(decoded.payload["text"], "hello");
    }

    #[test]
    fn defaults_fill_missing_fields() {
        // A minimal producer may omit priority, ttl, and routing.
        let raw = serde_json::json!({
            "message_id": "m-1",
            "timestamp": 1000.0,
            "source": "device_manager",
            "destination": "broadcast",
            "message_type": "event",
            "payload": {},
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.priority, Priority::Normal);
        assert_eq!(env.ttl_seconds, 300.0);
        assert_eq!(env.routing.hops, 0);
        assert_eq!(env.routing.max_hops, 10);
    }

    #[test]
    fn expiry_boundary() {
        let mut env = Envelope::event("s", serde_json::json!({}));
        env.timestamp = 1000.0;
        env.ttl_seconds = 300.0;
        assert!(!env.is_expired(1300.0));
        assert!(env.is_expired(1300.1));
    }

    #[test]
    fn hop_limit_enforced() {
        let mut env = Envelope::event("s", serde_json::json!({}));
        env.routing.max_hops = 2;
        assert!(env.next_hop());
        assert!(env.next_hop());
        assert!(!env.next_hop());
        assert_eq!(env.routing.hops, 3);
    }

    #[test]
    fn reply_targets_request_source() {
        let req = Envelope::new(
            "speaker_1",
            "security_gateway",
            MessageType::Request,
            serde_json::json!({"token": "abc"}),
        );
        let resp = req.reply("security_gateway", serde_json::json!({"valid": true}));
        assert_eq!(resp.destination, "speaker_1");
        assert_eq!(resp.message_type, MessageType::Response);
        assert_eq!(resp.payload["request_id"], req.message_id.as_str());
    }

    #[test]
    fn error_reply_carries_kind_and_original() {
        let req = Envelope::new(
            "client",
            "tts_service",
            MessageType::Request,
            serde_json::json!({"text": ""}),
        );
        let err = req.error_reply("tts_service", ErrorKind::Validation, "empty text");
        assert_eq!(err.message_type, MessageType::Error);
        assert_eq!(err.payload["error_kind"], "validation");
        assert_eq!(err.payload["original_request"]["text"], "");
    }

    #[test]
    fn message_type_wire_names_are_lowercase() {
        let json = serde_json::to_value(MessageType::Command).unwrap();
        assert_eq!(json, "command");
        let json = serde_json::to_value(Priority::High).unwrap();
        assert_eq!(json, "high");
    }
}
