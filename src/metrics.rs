//! Metric helpers for `wsdispatch`.
//!
//! Names and thin wrappers around the [`metrics`](https://docs.rs/metrics)
//! crate. Without the `metrics` feature every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::{error::ErrorCode, limits::LimitKind, rpc::RpcPhase};

/// Gauge tracking open connections.
pub const CONNECTIONS_ACTIVE: &str = "wsdispatch_connections_active";
/// Counter of frames by direction.
pub const FRAMES_TOTAL: &str = "wsdispatch_frames_total";
/// Counter of error envelopes by code.
pub const ERRORS_TOTAL: &str = "wsdispatch_errors_total";
/// Counter of RPC terminal transitions by outcome.
pub const RPC_TERMINAL_TOTAL: &str = "wsdispatch_rpc_terminal_total";
/// Counter of limit violations by kind.
pub const LIMIT_EXCEEDED_TOTAL: &str = "wsdispatch_limit_exceeded_total";

/// Direction of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Frames received from a client.
    Inbound,
    /// Frames sent to a client.
    Outbound,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame in the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record an error envelope with `code`.
pub fn inc_errors(code: &ErrorCode) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "code" => code.as_str().to_owned()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = code;
}

/// Record an RPC reaching a terminal phase.
pub fn inc_rpc_terminal(outcome: RpcPhase) {
    #[cfg(feature = "metrics")]
    counter!(RPC_TERMINAL_TOTAL, "outcome" => outcome.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record a limit violation.
pub fn inc_limit_exceeded(kind: LimitKind) {
    #[cfg(feature = "metrics")]
    counter!(LIMIT_EXCEEDED_TOTAL, "kind" => kind.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}
