//! Frame decoder and guard.
//!
//! Turns one raw inbound frame into a [`Decoded`] value. Malformed input is
//! reported as `INVALID_ARGUMENT` without closing the connection; reserved
//! control types are intercepted here so they never reach user routing.

use serde_json::Value;

use crate::{
    envelope::{self, Envelope, meta},
    error::WsError,
};

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Client heartbeat; answer with an ack and stop.
    Heartbeat,
    /// Client answered a server ping.
    Pong,
    /// Client asked to cancel the RPC with this correlation id.
    Abort(Option<String>),
    /// A user message bound for the registry.
    Message(Envelope),
}

/// Decode `raw` and stamp the server-owned meta fields.
///
/// # Errors
///
/// Returns `INVALID_ARGUMENT` for non-JSON input, non-object frames, or a
/// missing or empty `type`, and `PERMISSION_DENIED` when a client uses an
/// unknown reserved type.
pub fn decode(raw: &[u8], client_id: &str, received_at_ms: u64) -> Result<Decoded, WsError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| WsError::invalid_argument("malformed frame: invalid JSON").with_cause(e))?;
    let Value::Object(mut object) = value else {
        return Err(WsError::invalid_argument("malformed frame: expected an object"));
    };

    let message_type = match object.remove("type") {
        Some(Value::String(t)) if !t.is_empty() => t,
        _ => return Err(WsError::invalid_argument("malformed frame: missing message type")),
    };

    if envelope::is_reserved(&message_type) {
        return guard_reserved(&message_type, object.get("meta"));
    }

    let mut meta = match object.remove("meta") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(WsError::invalid_argument("malformed frame: meta must be an object")
                .with_detail("type", message_type));
        }
    };
    meta.insert(meta::CLIENT_ID.to_owned(), Value::String(client_id.to_owned()));
    meta.insert(meta::RECEIVED_AT.to_owned(), Value::from(received_at_ms));

    Ok(Decoded::Message(Envelope {
        message_type,
        meta,
        payload: object.remove("payload").filter(|p| !p.is_null()),
    }))
}

fn guard_reserved(message_type: &str, meta: Option<&Value>) -> Result<Decoded, WsError> {
    match message_type {
        envelope::HEARTBEAT => Ok(Decoded::Heartbeat),
        envelope::PONG => Ok(Decoded::Pong),
        envelope::RPC_ABORT => {
            let id = meta
                .and_then(|m| m.get(meta::CORRELATION_ID))
                .and_then(envelope::correlation_from);
            Ok(Decoded::Abort(id))
        }
        other => Err(
            WsError::permission_denied("reserved message type").with_detail("type", other),
        ),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::{Decoded, decode};
    use crate::error::ErrorCode;

    fn message(raw: &str) -> crate::envelope::Envelope {
        match decode(raw.as_bytes(), "c-1", 100).expect("decode") {
            Decoded::Message(env) => env,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[rstest]
    #[case("not json")]
    #[case("[1,2]")]
    #[case("{\"meta\":{}}")]
    #[case("{\"type\":\"\"}")]
    #[case("{\"type\":7}")]
    #[case("{\"type\":\"A\",\"meta\":3}")]
    fn malformed_frames_are_invalid_argument(#[case] raw: &str) {
        let err = decode(raw.as_bytes(), "c", 0).expect_err("must reject");
        assert_eq!(err.code(), &ErrorCode::InvalidArgument);
        assert!(!err.is_retryable());
    }

    #[test]
    fn heartbeat_is_intercepted() {
        assert_eq!(
            decode(br#"{"type":"__heartbeat"}"#, "c", 0).expect("decode"),
            Decoded::Heartbeat
        );
    }

    #[test]
    fn unknown_reserved_type_is_policy_violation() {
        let err = decode(br#"{"type":"__admin"}"#, "c", 0).expect_err("reject");
        assert_eq!(err.code(), &ErrorCode::PermissionDenied);
    }

    #[test]
    fn abort_carries_correlation_id() {
        let decoded = decode(br#"{"type":"__rpc_abort","meta":{"correlationId":"r1"}}"#, "c", 0)
            .expect("decode");
        assert_eq!(decoded, Decoded::Abort(Some("r1".into())));
    }

    #[test]
    fn server_meta_overrides_client_values() {
        let env = message(r#"{"type":"CHAT","meta":{"clientId":"spoof","receivedAt":1,"x":2},"payload":{"t":"hi"}}"#);
        assert_eq!(env.message_type, "CHAT");
        assert_eq!(env.meta["clientId"], json!("c-1"));
        assert_eq!(env.meta["receivedAt"], json!(100));
        assert_eq!(env.meta["x"], json!(2));
        assert_eq!(env.payload, Some(json!({"t": "hi"})));
    }

    #[test]
    fn null_payload_is_absent() {
        let env = message(r#"{"type":"PING_APP","payload":null}"#);
        assert!(env.payload.is_none());
    }
}
