//! Builders for raw inbound frames.

use serde_json::{Value, json};

/// One-way message frame.
#[must_use]
pub fn message(message_type: &str, payload: Option<Value>) -> String {
    match payload {
        Some(payload) => json!({"type": message_type, "payload": payload}),
        None => json!({"type": message_type}),
    }
    .to_string()
}

/// RPC request frame. `timeout_ms` sets `meta.timeoutMs`.
#[must_use]
pub fn rpc_request(
    message_type: &str,
    correlation_id: &str,
    payload: Option<Value>,
    timeout_ms: Option<u64>,
) -> String {
    let mut meta = json!({"correlationId": correlation_id});
    if let Some(ms) = timeout_ms {
        meta["timeoutMs"] = json!(ms);
    }
    let mut frame = json!({"type": message_type, "meta": meta});
    if let Some(payload) = payload {
        frame["payload"] = payload;
    }
    frame.to_string()
}

/// Client heartbeat frame.
#[must_use]
pub fn heartbeat() -> String { json!({"type": "__heartbeat"}).to_string() }

/// Client RPC abort frame.
#[must_use]
pub fn abort(correlation_id: &str) -> String {
    json!({"type": "__rpc_abort", "meta": {"correlationId": correlation_id}}).to_string()
}
