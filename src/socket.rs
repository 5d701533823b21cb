//! Platform socket contract and the outbound path built on it.
//!
//! A [`PlatformSocket`] is the minimal surface the engine needs from a
//! transport adapter. [`Outbound`] wraps it with serialisation, backpressure
//! decisions and close-once semantics.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    envelope::{Envelope, unix_millis},
    error::WsError,
    metrics::{self, Direction},
};

/// Failure reported by a platform socket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketError {
    /// The socket is closed.
    #[error("socket closed")]
    Closed,
    /// The transport rejected the frame.
    #[error("send failed: {0}")]
    Failed(String),
}

/// Minimal socket surface supplied by a platform adapter.
pub trait PlatformSocket: Send + Sync + 'static {
    /// Queue a text frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`SocketError`] if the frame cannot be queued.
    fn send(&self, frame: &str) -> Result<(), SocketError>;

    /// Close the connection with a WebSocket close code and reason.
    fn close(&self, code: u16, reason: &str);

    /// Bytes queued but not yet flushed.
    fn buffered_amount(&self) -> usize { 0 }

    /// Native topic subscription, for platforms that fan out themselves.
    fn subscribe(&self, _topic: &str) {}

    /// Native topic unsubscription.
    fn unsubscribe(&self, _topic: &str) {}
}

/// Outbound side of one connection.
#[derive(Clone)]
pub struct Outbound {
    socket: Arc<dyn PlatformSocket>,
    buffer_limit: Option<usize>,
    drop_progress: bool,
    closed: Arc<AtomicBool>,
}

impl Outbound {
    pub(crate) fn new(
        socket: Arc<dyn PlatformSocket>,
        buffer_limit: Option<usize>,
        drop_progress: bool,
    ) -> Self {
        Self {
            socket,
            buffer_limit,
            drop_progress,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<dyn PlatformSocket> { &self.socket }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Whether the socket buffer is over the configured limit.
    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.buffer_limit
            .is_some_and(|limit| self.socket.buffered_amount() > limit)
    }

    /// Send `envelope` as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `CONNECTION_CLOSED` once the connection is closing, or
    /// `UNAVAILABLE` if the socket rejects the frame.
    pub fn send(&self, envelope: &Envelope) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::connection_closed("connection closed"));
        }
        let frame = envelope
            .to_json()
            .map_err(|e| WsError::internal("failed to encode outbound frame").with_cause(e))?;
        self.socket.send(&frame).map_err(|e| match e {
            SocketError::Closed => WsError::connection_closed("connection closed").with_cause(e),
            SocketError::Failed(_) => WsError::unavailable("socket send failed").with_cause(e),
        })?;
        metrics::inc_frames(Direction::Outbound);
        Ok(())
    }

    /// Best-effort send for non-terminal frames.
    ///
    /// Returns `false` when the frame was dropped.
    pub fn send_best_effort(&self, envelope: &Envelope) -> bool {
        if self.drop_progress && self.is_backpressured() {
            debug!(
                "dropping progress frame under backpressure: type={}",
                envelope.message_type
            );
            return false;
        }
        match self.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!("best-effort send failed: type={}, error={e}", envelope.message_type);
                false
            }
        }
    }

    /// Send a terminal RPC frame.
    ///
    /// Under backpressure the frame is replaced by a small
    /// `RESOURCE_EXHAUSTED` `RPC_ERROR` instead of being dropped.
    ///
    /// # Errors
    ///
    /// As [`Outbound::send`].
    pub fn send_terminal(
        &self,
        envelope: &Envelope,
        correlation_id: &str,
        expose_details: bool,
    ) -> Result<(), WsError> {
        if self.is_backpressured() {
            warn!(
                "socket buffer over limit, replacing terminal reply: correlation_id={correlation_id}"
            );
            let err = WsError::resource_exhausted("socket buffer full, reply discarded");
            let frame = Envelope::rpc_error(
                correlation_id,
                &err.to_payload(expose_details),
                unix_millis(),
            );
            return self.send(&frame);
        }
        self.send(envelope)
    }

    /// Close the socket once; later calls are ignored.
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.socket.close(code, reason);
        true
    }

    /// Mark the connection closed without calling into the socket, used when
    /// the transport reported the close itself.
    pub(crate) fn mark_closed(&self) -> bool { !self.closed.swap(true, Ordering::AcqRel) }
}
