//! Context handed to middleware and handlers.

use std::{fmt, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{
    connection::{ConnectionData, ConnectionInfo},
    envelope::Envelope,
    error::WsError,
    rpc::{CancellationSignal, Responder},
};

/// One inbound message together with its connection.
///
/// Cloning is cheap; clones share the connection, the envelope and, for
/// RPCs, the one-shot reply state.
#[derive(Clone)]
pub struct MessageContext {
    conn: ConnectionInfo,
    envelope: Arc<Envelope>,
    responder: Option<Responder>,
}

impl MessageContext {
    pub(crate) fn new(conn: ConnectionInfo, envelope: Envelope, responder: Option<Responder>) -> Self {
        Self {
            conn,
            envelope: Arc::new(envelope),
            responder,
        }
    }

    #[must_use]
    pub fn message_type(&self) -> &str { &self.envelope.message_type }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> { self.envelope.payload.as_ref() }

    /// Deserialize the payload; a missing payload is read as `null`.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` if the payload does not fit `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, WsError> {
        let value = self.envelope.payload.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Meta as received, with `clientId` and `receivedAt` set by the server.
    #[must_use]
    pub fn meta(&self) -> &Map<String, Value> { &self.envelope.meta }

    #[must_use]
    pub fn envelope(&self) -> &Envelope { &self.envelope }

    #[must_use]
    pub fn correlation_id(&self) -> Option<String> { self.envelope.correlation_id() }

    #[must_use]
    pub fn client_id(&self) -> &str { self.conn.client_id() }

    #[must_use]
    pub fn connection(&self) -> &ConnectionInfo { &self.conn }

    #[must_use]
    pub fn data(&self) -> ConnectionData { self.conn.data() }

    #[must_use]
    pub fn data_get(&self, key: &str) -> Option<Value> { self.conn.data_get(key) }

    pub fn assign_data(&self, partial: Map<String, Value>) { self.conn.assign_data(partial); }

    /// Send a one-way message. Never counts as an RPC reply.
    ///
    /// # Errors
    ///
    /// See [`ConnectionInfo::send`].
    pub fn send(&self, message_type: &str, payload: Option<Value>) -> Result<(), WsError> {
        self.conn.send(message_type, payload)
    }

    #[must_use]
    pub fn is_rpc(&self) -> bool { self.responder.is_some() }

    fn rpc(&self, operation: &str) -> Result<&Responder, WsError> {
        self.responder.as_ref().ok_or_else(|| {
            WsError::failed_precondition(format!("{operation} is only available for rpc messages"))
        })
    }

    /// Send the RPC's terminal reply. Returns `false` if already settled.
    ///
    /// # Errors
    ///
    /// `FAILED_PRECONDITION` outside an RPC, or the socket failure.
    pub fn reply(&self, payload: Option<Value>) -> Result<bool, WsError> {
        self.rpc("reply")?.reply(payload)
    }

    /// Send the RPC's terminal error. Returns `false` if already settled.
    ///
    /// # Errors
    ///
    /// As [`MessageContext::reply`].
    pub fn error(&self, err: &WsError) -> Result<bool, WsError> { self.rpc("error")?.error(err) }

    /// Send a best-effort progress update.
    ///
    /// # Errors
    ///
    /// `FAILED_PRECONDITION` outside an RPC.
    pub fn progress(&self, payload: Option<Value>) -> Result<bool, WsError> {
        Ok(self.rpc("progress")?.progress(payload))
    }

    /// Time left before the RPC deadline; `None` outside an RPC.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.responder.as_ref().map(Responder::time_remaining)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> { self.responder.as_ref().map(Responder::deadline) }

    #[must_use]
    pub fn signal(&self) -> Option<&CancellationSignal> {
        self.responder.as_ref().map(Responder::signal)
    }

    /// Register a callback run if the RPC is cancelled.
    ///
    /// # Errors
    ///
    /// `FAILED_PRECONDITION` outside an RPC.
    pub fn on_cancel<F>(&self, callback: F) -> Result<(), WsError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.rpc("on_cancel")?.on_cancel(callback);
        Ok(())
    }

    /// Owned reply handle for answering after the handler returns.
    #[must_use]
    pub fn responder(&self) -> Option<Responder> { self.responder.clone() }

    /// # Errors
    ///
    /// See [`ConnectionInfo::subscribe`].
    pub async fn subscribe(&self, topic: &str) -> Result<(), WsError> {
        self.conn.subscribe(topic).await
    }

    /// # Errors
    ///
    /// See [`ConnectionInfo::unsubscribe`].
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), WsError> {
        self.conn.unsubscribe(topic).await
    }

    /// # Errors
    ///
    /// See [`ConnectionInfo::publish`].
    pub async fn publish(
        &self,
        topic: &str,
        message_type: &str,
        payload: Option<Value>,
    ) -> Result<Option<usize>, WsError> {
        self.conn.publish(topic, message_type, payload).await
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> { self.conn.topics() }

    pub fn close(&self, code: u16, reason: &str) -> bool { self.conn.close(code, reason) }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("type", &self.envelope.message_type)
            .field("connection", &self.conn.id())
            .field("rpc", &self.responder.is_some())
            .finish()
    }
}
