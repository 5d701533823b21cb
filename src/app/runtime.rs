//! Serving connections.

use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::builder::WsRouter;
use crate::{
    connection::{ConnectOptions, ConnectionActor, ConnectionHandle, ConnectionInfo, Shared},
    envelope::{Envelope, unix_millis},
    error::{CapabilityError, WsError},
    pubsub::{PublishOptions, validate_topic},
    rpc::{RpcSettings, RpcTable},
    socket::{Outbound, PlatformSocket},
};

impl WsRouter {
    /// Start serving `socket` and return the transport's handle to it.
    ///
    /// Must be called from within a Tokio runtime. `on_open` hooks run on
    /// the connection task before the first delivered frame is processed.
    pub fn connect(&self, socket: Arc<dyn PlatformSocket>, options: ConnectOptions) -> ConnectionHandle {
        let config = &self.core.config;
        let outbound = Outbound::new(
            socket,
            config.socket_buffer_limit_bytes,
            config.drop_progress_on_backpressure,
        );
        let rpc = Arc::new(RpcTable::new(RpcSettings::from(config)));
        let client_id = options
            .client_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let conn = ConnectionInfo(Arc::new(Shared::new(
            client_id,
            options.data,
            outbound,
            rpc,
            self.core.pubsub.clone(),
        )));

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor::new(
            Arc::clone(&self.core),
            conn.clone(),
            rx,
            self.shutdown.clone(),
            self.tracker.clone(),
        );
        let span = tracing::info_span!("connection", id = %conn.id(), client_id = %conn.client_id());
        self.tracker.spawn(actor.run().instrument(span));

        ConnectionHandle::new(
            conn,
            tx,
            config.limits.max_payload_bytes,
            config.limits.max_pending,
        )
    }

    /// Publish to `topic` from outside any connection.
    ///
    /// # Errors
    ///
    /// `UNIMPLEMENTED` without a Pub/Sub adapter, `INVALID_ARGUMENT` for a
    /// bad topic, or the adapter's failure.
    pub async fn publish(
        &self,
        topic: &str,
        message_type: &str,
        payload: Option<Value>,
    ) -> Result<Option<usize>, WsError> {
        let adapter = self
            .core
            .pubsub
            .as_ref()
            .ok_or(CapabilityError::Unavailable {
                capability: "pubsub",
                operation: "publish",
            })?;
        validate_topic(topic)?;
        let mut envelope = Envelope::new(message_type).stamped(unix_millis());
        envelope.payload = payload;
        adapter
            .publish(&envelope, &PublishOptions::topic(topic))
            .await
            .into_result()
    }

    /// Number of connection tasks still running.
    #[must_use]
    pub fn active_connections(&self) -> usize { self.tracker.len() }

    /// Close every connection with 1001 and wait for their teardown.
    pub async fn shutdown(&self) {
        info!("router shutting down: connections={}", self.tracker.len());
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(adapter) = &self.core.pubsub
            && let Err(e) = adapter.close().await
        {
            warn!("pubsub adapter close failed: error={e}");
        }
    }
}
