//! Per-connection state, the ingress handle and the connection actor.
//!
//! [`crate::app::WsRouter::connect`] spawns one actor per socket. The
//! transport feeds raw frames through [`ConnectionHandle::deliver`], which
//! applies the limits and decodes them. The actor processes queued messages
//! one at a time on a single pipeline while the heartbeat and the RPC idle
//! sweep run on the same task, so a reply can never race an expiry.

mod actor;
mod data;
mod event;
mod pipeline;

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
pub use data::ConnectionData;
use log::debug;
use serde_json::{Map, Value};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

pub(crate) use self::actor::ConnectionActor;
use self::event::{Ingress, Work};
use crate::{
    envelope::{Envelope, unix_millis},
    error::{CapabilityError, WsError},
    frame::{self, Decoded},
    limits::{LimitExceeded, PendingCounter, check_payload},
    metrics::{self, Direction},
    pubsub::{PubSubAdapter, PublishOptions, validate_topic},
    rpc::RpcTable,
    socket::Outbound,
};

/// Close code used when authentication fails.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
/// Close code used when an operation is not permitted.
pub const CLOSE_PERMISSION_DENIED: u16 = 4403;
/// Close code used when the router shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code recorded when the transport vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Options for a new connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Client id; a random UUID when absent.
    pub client_id: Option<String>,
    /// Initial contents of the data bag.
    pub data: Map<String, Value>,
}

impl ConnectOptions {
    #[must_use]
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Which side closed the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseSource {
    Server,
    Peer,
}

/// How a connection ended, passed to `on_close` hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub source: CloseSource,
}

pub(crate) struct Shared {
    id: String,
    client_id: String,
    data: Mutex<ConnectionData>,
    pub(crate) outbound: Outbound,
    pub(crate) pending: PendingCounter,
    /// Refusals not yet reported to the client.
    pub(crate) rejections: AtomicUsize,
    pub(crate) rpc: Arc<RpcTable>,
    topics: Mutex<BTreeSet<String>>,
    pubsub: Option<Arc<dyn PubSubAdapter>>,
    last_inbound: Mutex<Instant>,
    close_info: Mutex<Option<CloseInfo>>,
    pub(crate) closing: CancellationToken,
    pub(crate) done: CancellationToken,
}

impl Shared {
    pub(crate) fn new(
        client_id: String,
        data: Map<String, Value>,
        outbound: Outbound,
        rpc: Arc<RpcTable>,
        pubsub: Option<Arc<dyn PubSubAdapter>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_id,
            data: Mutex::new(ConnectionData::new(data)),
            outbound,
            pending: PendingCounter::new(),
            rejections: AtomicUsize::new(0),
            rpc,
            topics: Mutex::new(BTreeSet::new()),
            pubsub,
            last_inbound: Mutex::new(Instant::now()),
            close_info: Mutex::new(None),
            closing: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    fn touch_inbound(&self) { *self.last_inbound.lock().expect("lock poisoned") = Instant::now(); }

    pub(crate) fn last_inbound(&self) -> Instant { *self.last_inbound.lock().expect("lock poisoned") }

    /// Record the first close and wake the actor.
    fn begin_close(&self, info: CloseInfo) {
        let mut slot = self.close_info.lock().expect("lock poisoned");
        if slot.is_none() {
            *slot = Some(info);
        }
        drop(slot);
        self.closing.cancel();
    }

    pub(crate) fn close_info(&self) -> Option<CloseInfo> {
        self.close_info.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn take_topics(&self) -> Vec<String> {
        std::mem::take(&mut *self.topics.lock().expect("lock poisoned"))
            .into_iter()
            .collect()
    }

    pub(crate) fn pubsub(&self) -> Option<&Arc<dyn PubSubAdapter>> { self.pubsub.as_ref() }
}

/// Cheap, cloneable view of one connection, handed to hooks and handlers.
#[derive(Clone)]
pub struct ConnectionInfo(pub(crate) Arc<Shared>);

impl ConnectionInfo {
    /// Server-assigned connection id.
    #[must_use]
    pub fn id(&self) -> &str { &self.0.id }

    #[must_use]
    pub fn client_id(&self) -> &str { &self.0.client_id }

    /// Snapshot of the data bag.
    #[must_use]
    pub fn data(&self) -> ConnectionData { self.0.data.lock().expect("lock poisoned").clone() }

    /// One value from the data bag.
    #[must_use]
    pub fn data_get(&self, key: &str) -> Option<Value> {
        self.0.data.lock().expect("lock poisoned").get(key).cloned()
    }

    /// Shallow-merge `partial` into the data bag; `null` values remove keys.
    pub fn assign_data(&self, partial: Map<String, Value>) {
        self.0.data.lock().expect("lock poisoned").assign(partial);
    }

    /// Send a one-way message.
    ///
    /// # Errors
    ///
    /// Returns `CONNECTION_CLOSED` after close, or the socket failure.
    pub fn send(&self, message_type: &str, payload: Option<Value>) -> Result<(), WsError> {
        let mut envelope = Envelope::new(message_type).stamped(unix_millis());
        envelope.payload = payload;
        self.0.outbound.send(&envelope)
    }

    /// Close the connection. Returns `false` if it was already closing.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        let closed = self.0.outbound.close(code, reason);
        if closed {
            self.0.begin_close(CloseInfo {
                code,
                reason: reason.to_owned(),
                source: CloseSource::Server,
            });
        }
        closed
    }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.outbound.is_closed() }

    /// Frames accepted but not yet settled.
    #[must_use]
    pub fn pending(&self) -> usize { self.0.pending.current() }

    /// RPCs awaiting a terminal reply.
    #[must_use]
    pub fn rpc_inflight(&self) -> usize { self.0.rpc.inflight() }

    /// Topics this connection is subscribed to, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.0
            .topics
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn pubsub(&self, operation: &'static str) -> Result<&Arc<dyn PubSubAdapter>, WsError> {
        self.0.pubsub.as_ref().ok_or_else(|| {
            CapabilityError::Unavailable {
                capability: "pubsub",
                operation,
            }
            .into()
        })
    }

    /// Subscribe to `topic`. Subscribing twice changes nothing.
    ///
    /// # Errors
    ///
    /// `UNIMPLEMENTED` without a Pub/Sub adapter, `INVALID_ARGUMENT` for a
    /// bad topic, or the adapter's failure.
    pub async fn subscribe(&self, topic: &str) -> Result<(), WsError> {
        let adapter = self.pubsub("subscribe")?;
        validate_topic(topic)?;
        if self.0.topics.lock().expect("lock poisoned").contains(topic) {
            return Ok(());
        }
        adapter.subscribe(self.id(), topic).await?;
        self.0.outbound.socket().subscribe(topic);
        self.0
            .topics
            .lock()
            .expect("lock poisoned")
            .insert(topic.to_owned());
        Ok(())
    }

    /// Unsubscribe from `topic`; unknown topics are ignored.
    ///
    /// # Errors
    ///
    /// As [`ConnectionInfo::subscribe`].
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), WsError> {
        let adapter = self.pubsub("unsubscribe")?;
        validate_topic(topic)?;
        if !self.0.topics.lock().expect("lock poisoned").remove(topic) {
            return Ok(());
        }
        self.0.outbound.socket().unsubscribe(topic);
        adapter.unsubscribe(self.id(), topic).await
    }

    /// Publish a message to `topic`, excluding this connection.
    ///
    /// Returns the number of matched subscribers when the adapter reports it.
    ///
    /// # Errors
    ///
    /// As [`ConnectionInfo::subscribe`], plus the adapter's publish failure.
    pub async fn publish(
        &self,
        topic: &str,
        message_type: &str,
        payload: Option<Value>,
    ) -> Result<Option<usize>, WsError> {
        let adapter = self.pubsub("publish")?;
        validate_topic(topic)?;
        let mut envelope = Envelope::new(message_type).stamped(unix_millis());
        envelope.payload = payload;
        let options = PublishOptions::topic(topic).excluding(self.id());
        adapter.publish(&envelope, &options).await.into_result()
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.0.id)
            .field("client_id", &self.0.client_id)
            .finish_non_exhaustive()
    }
}

/// Transport-side handle for one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: ConnectionInfo,
    tx: mpsc::UnboundedSender<Ingress>,
    max_payload_bytes: Option<usize>,
    max_pending: Option<usize>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        conn: ConnectionInfo,
        tx: mpsc::UnboundedSender<Ingress>,
        max_payload_bytes: Option<usize>,
        max_pending: Option<usize>,
    ) -> Self {
        Self {
            conn,
            tx,
            max_payload_bytes,
            max_pending,
        }
    }

    /// Hand one inbound text frame to the connection.
    ///
    /// The frame is size-checked and decoded here. Control frames skip the
    /// pending ceiling; every other frame takes a slot before it is queued.
    /// Returns `false` if the frame was rejected or the connection is closed.
    /// Rejections are reported right away, ahead of queued work.
    pub fn deliver(&self, raw: impl Into<Bytes>) -> bool {
        let raw = raw.into();
        if self.conn.is_closed() {
            debug!("frame after close dropped: id={}", self.conn.id());
            return false;
        }
        self.conn.0.touch_inbound();
        if let Err(limit) = check_payload(raw.len(), self.max_payload_bytes) {
            self.reject(limit);
            return false;
        }
        metrics::inc_frames(Direction::Inbound);
        let received_at = Instant::now();
        let decoded = match frame::decode(&raw, self.conn.client_id(), unix_millis()) {
            Ok(Decoded::Message(envelope)) => Ok(envelope),
            Ok(control) => return self.tx.send(Ingress::Control(control)).is_ok(),
            Err(error) => Err(error),
        };
        let slot = match self.conn.0.pending.try_acquire(self.max_pending) {
            Ok(slot) => slot,
            Err(limit) => {
                self.reject(limit);
                return false;
            }
        };
        let work = match decoded {
            Ok(envelope) => Work::Message {
                envelope,
                received_at,
                slot,
            },
            Err(error) => Work::Invalid { error, slot },
        };
        self.tx.send(Ingress::Work(work)).is_ok()
    }

    /// Queue a rejection report unless one is already waiting.
    fn reject(&self, limit: LimitExceeded) {
        if self.conn.0.rejections.fetch_add(1, Ordering::AcqRel) == 0 {
            let _ = self.tx.send(Ingress::Rejected(limit));
        }
    }

    /// Transport-level pong; counts as inbound activity.
    pub fn pong(&self) { self.conn.0.touch_inbound(); }

    /// Report that the transport closed.
    pub fn close(&self, code: u16, reason: &str) {
        if self.conn.0.outbound.mark_closed() {
            self.conn.0.begin_close(CloseInfo {
                code,
                reason: reason.to_owned(),
                source: CloseSource::Peer,
            });
        }
    }

    /// Wait until the connection finished its teardown.
    pub async fn closed(&self) { self.conn.0.done.cancelled().await; }

    #[must_use]
    pub fn id(&self) -> &str { self.conn.id() }

    #[must_use]
    pub fn pending(&self) -> usize { self.conn.pending() }

    #[must_use]
    pub fn data(&self) -> ConnectionData { self.conn.data() }

    #[must_use]
    pub fn info(&self) -> &ConnectionInfo { &self.conn }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.conn.id())
            .finish_non_exhaustive()
    }
}
