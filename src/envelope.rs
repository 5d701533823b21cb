//! The `{type, meta, payload}` envelope exchanged over a connection.
//!
//! Inbound frames are decoded into an [`Envelope`] by [`crate::frame`]; every
//! outbound frame the engine produces is built here so the three wire shapes
//! (one-way, `ERROR`, `RPC_ERROR`) stay consistent.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;

/// Prefix reserved for engine-internal control messages.
pub const RESERVED_PREFIX: &str = "__";
/// Client liveness probe answered directly by the decoder.
pub const HEARTBEAT: &str = "__heartbeat";
/// Reply to [`HEARTBEAT`].
pub const HEARTBEAT_ACK: &str = "__heartbeat_ack";
/// Server-initiated liveness probe.
pub const PING: &str = "__ping";
/// Client reply to [`PING`].
pub const PONG: &str = "__pong";
/// Client request to cancel an in-flight RPC.
pub const RPC_ABORT: &str = "__rpc_abort";
/// Non-terminal RPC progress update.
pub const RPC_PROGRESS: &str = "__rpc_progress";
/// One-way error frame type.
pub const ERROR: &str = "ERROR";
/// Terminal RPC error frame type.
pub const RPC_ERROR: &str = "RPC_ERROR";

/// Well-known meta keys.
pub mod meta {
    pub const CLIENT_ID: &str = "clientId";
    pub const RECEIVED_AT: &str = "receivedAt";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const TIMEOUT_MS: &str = "timeoutMs";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TS: &str = "ts";
}

/// Client-sendable system types under the reserved prefix.
const SYSTEM_TYPES: &[&str] = &[HEARTBEAT, PONG, RPC_ABORT];

/// Return `true` if `message_type` uses the reserved prefix.
#[must_use]
pub fn is_reserved(message_type: &str) -> bool { message_type.starts_with(RESERVED_PREFIX) }

/// Return `true` if `message_type` is a known client-sendable system message.
#[must_use]
pub fn is_system(message_type: &str) -> bool { SYSTEM_TYPES.contains(&message_type) }

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A decoded or outbound message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Create an envelope with empty meta and no payload.
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            meta: Map::new(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Stamp the server timestamp.
    #[must_use]
    pub fn stamped(self, now_ms: u64) -> Self { self.with_meta(meta::TIMESTAMP, now_ms) }

    /// Correlation id supplied by the client.
    ///
    /// Strings are used verbatim and integers are rendered in decimal; empty
    /// strings count as absent.
    #[must_use]
    pub fn correlation_id(&self) -> Option<String> {
        self.meta.get(meta::CORRELATION_ID).and_then(correlation_from)
    }

    /// Client-declared RPC timeout, if a positive integer.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        self.meta
            .get(meta::TIMEOUT_MS)
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
    }

    /// Serialise to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if a payload value cannot be encoded.
    pub fn to_json(&self) -> Result<String, serde_json::Error> { serde_json::to_string(self) }

    /// `{type:"__heartbeat_ack", meta:{ts}}`.
    #[must_use]
    pub fn heartbeat_ack(now_ms: u64) -> Self { Self::new(HEARTBEAT_ACK).with_meta(meta::TS, now_ms) }

    /// `{type:"__ping", meta:{ts}}`.
    #[must_use]
    pub fn ping(now_ms: u64) -> Self { Self::new(PING).with_meta(meta::TS, now_ms) }

    /// One-way `ERROR` frame. Carries no connection id.
    #[must_use]
    pub fn error(payload: &ErrorPayload, now_ms: u64) -> Self {
        Self::new(ERROR)
            .stamped(now_ms)
            .with_payload(error_value(payload))
    }

    /// Terminal `RPC_ERROR` frame for `correlation_id`.
    #[must_use]
    pub fn rpc_error(correlation_id: &str, payload: &ErrorPayload, now_ms: u64) -> Self {
        Self::new(RPC_ERROR)
            .stamped(now_ms)
            .with_meta(meta::CORRELATION_ID, correlation_id)
            .with_payload(error_value(payload))
    }

    /// Terminal RPC reply of `response_type`.
    #[must_use]
    pub fn rpc_reply(
        response_type: &str,
        correlation_id: &str,
        payload: Option<Value>,
        now_ms: u64,
    ) -> Self {
        let mut env = Self::new(response_type)
            .stamped(now_ms)
            .with_meta(meta::CORRELATION_ID, correlation_id);
        env.payload = payload;
        env
    }

    /// Non-terminal RPC progress update.
    #[must_use]
    pub fn rpc_progress(correlation_id: &str, payload: Option<Value>, now_ms: u64) -> Self {
        Self::rpc_reply(RPC_PROGRESS, correlation_id, payload, now_ms)
    }
}

pub(crate) fn correlation_from(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}

fn error_value(payload: &ErrorPayload) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| {
        let mut fallback = Map::new();
        fallback.insert("code".to_owned(), Value::String(payload.code.to_string()));
        Value::Object(fallback)
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::{Envelope, is_reserved, is_system};
    use crate::error::WsError;

    #[rstest]
    #[case(json!({"correlationId": "abc"}), Some("abc"))]
    #[case(json!({"correlationId": 42}), Some("42"))]
    #[case(json!({"correlationId": ""}), None)]
    #[case(json!({"correlationId": 1.5}), None)]
    #[case(json!({}), None)]
    fn correlation_id_normalisation(#[case] meta: serde_json::Value, #[case] expected: Option<&str>) {
        let env: Envelope =
            serde_json::from_value(json!({"type": "X", "meta": meta})).expect("decode");
        assert_eq!(env.correlation_id().as_deref(), expected);
    }

    #[rstest]
    #[case(json!(250), Some(250))]
    #[case(json!(0), None)]
    #[case(json!(-10), None)]
    #[case(json!("100"), None)]
    fn timeout_must_be_positive_integer(#[case] raw: serde_json::Value, #[case] expected: Option<u64>) {
        let env = Envelope::new("X").with_meta("timeoutMs", raw);
        assert_eq!(env.timeout_ms(), expected);
    }

    #[test]
    fn reserved_and_system_types() {
        assert!(is_reserved("__heartbeat"));
        assert!(is_system("__heartbeat"));
        assert!(is_reserved("__shutdown"));
        assert!(!is_system("__shutdown"));
        assert!(!is_reserved("_single"));
    }

    #[test]
    fn error_frames_have_expected_shape() {
        let payload = WsError::not_found("missing").to_payload(false);
        let one_way = serde_json::to_value(Envelope::error(&payload, 7)).expect("encode");
        assert_eq!(one_way["type"], "ERROR");
        assert_eq!(one_way["meta"], json!({"timestamp": 7}));
        assert_eq!(one_way["payload"]["code"], "NOT_FOUND");

        let rpc = serde_json::to_value(Envelope::rpc_error("c1", &payload, 9)).expect("encode");
        assert_eq!(rpc["type"], "RPC_ERROR");
        assert_eq!(rpc["meta"], json!({"timestamp": 9, "correlationId": "c1"}));
        assert_eq!(rpc["payload"], one_way["payload"]);
    }

    #[test]
    fn heartbeat_ack_shape() {
        let ack = serde_json::to_value(Envelope::heartbeat_ack(11)).expect("encode");
        assert_eq!(ack, json!({"type": "__heartbeat_ack", "meta": {"ts": 11}}));
    }
}
