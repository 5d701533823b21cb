//! Terminal and progress replies for one RPC.

use std::{sync::Arc, time::Duration};

use log::debug;
use serde_json::Value;
use tokio::time::Instant;

use super::{CancellationSignal, RpcPhase, RpcState, RpcTable};
use crate::{
    envelope::{Envelope, unix_millis},
    error::WsError,
    metrics,
    socket::Outbound,
};

/// Handle used to answer an RPC, possibly after the handler has returned.
///
/// Clones share the same state: only the first `reply` or `error` across all
/// clones sends a frame.
#[derive(Clone)]
pub struct Responder {
    state: Arc<RpcState>,
    table: Arc<RpcTable>,
    outbound: Outbound,
    expose_details: bool,
}

impl Responder {
    pub(crate) fn new(
        state: Arc<RpcState>,
        table: Arc<RpcTable>,
        outbound: Outbound,
        expose_details: bool,
    ) -> Self {
        Self {
            state,
            table,
            outbound,
            expose_details,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str { self.state.correlation_id() }

    #[must_use]
    pub fn deadline(&self) -> Instant { self.state.deadline() }

    #[must_use]
    pub fn time_remaining(&self) -> Duration { self.state.time_remaining() }

    #[must_use]
    pub fn phase(&self) -> RpcPhase { self.state.phase() }

    /// Whether a terminal transition already happened.
    #[must_use]
    pub fn is_settled(&self) -> bool { !self.state.is_pending() }

    #[must_use]
    pub fn signal(&self) -> &CancellationSignal { self.state.signal() }

    /// Send the terminal reply.
    ///
    /// A second terminal call, or one after cancellation or expiry, is
    /// ignored and returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Propagates socket failures from the send.
    pub fn reply(&self, payload: Option<Value>) -> Result<bool, WsError> {
        if !self.claim("reply") {
            return Ok(false);
        }
        let frame = Envelope::rpc_reply(
            self.state.response_type(),
            self.state.correlation_id(),
            payload,
            unix_millis(),
        );
        self.outbound
            .send_terminal(&frame, self.state.correlation_id(), self.expose_details)?;
        Ok(true)
    }

    /// Send a terminal `RPC_ERROR`.
    ///
    /// # Errors
    ///
    /// Propagates socket failures from the send.
    pub fn error(&self, err: &WsError) -> Result<bool, WsError> {
        if !self.claim("error") {
            return Ok(false);
        }
        metrics::inc_errors(err.code());
        let frame = Envelope::rpc_error(
            self.state.correlation_id(),
            &err.to_payload(self.expose_details),
            unix_millis(),
        );
        self.outbound
            .send_terminal(&frame, self.state.correlation_id(), self.expose_details)?;
        Ok(true)
    }

    /// Send a non-terminal progress update.
    ///
    /// Returns `false` if the RPC is already settled or the frame was
    /// dropped under backpressure.
    pub fn progress(&self, payload: Option<Value>) -> bool {
        if !self.state.is_pending() {
            debug!(
                "progress after terminal ignored: correlation_id={}",
                self.state.correlation_id()
            );
            return false;
        }
        self.state.touch();
        let frame = Envelope::rpc_progress(self.state.correlation_id(), payload, unix_millis());
        self.outbound.send_best_effort(&frame)
    }

    /// Register a callback for cancellation of this RPC.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.signal().on_cancel(callback);
    }

    fn claim(&self, kind: &str) -> bool {
        if !self.state.settle(RpcPhase::Replied) {
            debug!(
                "duplicate terminal {kind} ignored: correlation_id={}, phase={}",
                self.state.correlation_id(),
                self.state.phase().as_str()
            );
            return false;
        }
        self.table.complete(&self.state);
        true
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("correlation_id", &self.state.correlation_id())
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;
    use serde_json::{Value, json};
    use tokio::time::Instant;

    use super::Responder;
    use crate::{
        error::WsError,
        rpc::{RpcPhase, RpcSettings, RpcTable},
        socket::{Outbound, PlatformSocket, SocketError},
    };

    #[derive(Default)]
    struct Sink {
        frames: Mutex<Vec<String>>,
    }

    impl PlatformSocket for Sink {
        fn send(&self, frame: &str) -> Result<(), SocketError> {
            self.frames.lock().expect("lock").push(frame.to_owned());
            Ok(())
        }

        fn close(&self, _code: u16, _reason: &str) {}
    }

    fn responder() -> (Responder, Arc<Sink>, Arc<RpcTable>) {
        let sink = Arc::new(Sink::default());
        let table = Arc::new(RpcTable::new(RpcSettings::default()));
        let state = table
            .accept(Some("c1".into()), "ADD_RESULT", None, Instant::now())
            .expect("accept");
        let outbound = Outbound::new(sink.clone(), None, true);
        (Responder::new(state, Arc::clone(&table), outbound, false), sink, table)
    }

    fn frames(sink: &Sink) -> Vec<Value> {
        sink.frames
            .lock()
            .expect("lock")
            .iter()
            .map(|f| serde_json::from_str(f).expect("json"))
            .collect()
    }

    #[rstest]
    #[tokio::test]
    async fn only_first_terminal_is_sent() {
        let (responder, sink, table) = responder();
        let clone = responder.clone();
        assert!(responder.reply(Some(json!({"sum": 3}))).expect("reply"));
        assert!(!clone.reply(Some(json!({"sum": 4}))).expect("second"));
        assert!(!clone.error(&WsError::internal("late")).expect("late error"));

        let sent = frames(&sink);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "ADD_RESULT");
        assert_eq!(sent[0]["meta"]["correlationId"], "c1");
        assert_eq!(sent[0]["payload"]["sum"], 3);
        assert_eq!(table.inflight(), 0);
        assert!(table.was_answered("c1"));
    }

    #[rstest]
    #[tokio::test]
    async fn error_frame_carries_envelope() {
        let (responder, sink, _table) = responder();
        responder
            .error(&WsError::not_found("no such item"))
            .expect("error");
        let sent = frames(&sink);
        assert_eq!(sent[0]["type"], "RPC_ERROR");
        assert_eq!(sent[0]["payload"]["code"], "NOT_FOUND");
        assert_eq!(sent[0]["payload"]["retryable"], false);
        assert!(sent[0]["payload"].get("retryAfterMs").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn progress_stops_after_terminal() {
        let (responder, sink, _table) = responder();
        assert!(responder.progress(Some(json!({"pct": 50}))));
        responder.reply(None).expect("reply");
        assert!(!responder.progress(Some(json!({"pct": 90}))));
        let sent = frames(&sink);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["type"], "__rpc_progress");
        assert_eq!(responder.phase(), RpcPhase::Replied);
    }

    #[rstest]
    #[tokio::test]
    async fn reply_after_cancel_is_dropped() {
        let (responder, sink, table) = responder();
        assert!(table.cancel("c1"));
        assert!(!responder.reply(None).expect("reply"));
        assert!(frames(&sink).is_empty());
    }
}
