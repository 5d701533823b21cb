//! Connection actor.
//!
//! One task per connection multiplexes shutdown, the heartbeat, the RPC idle
//! sweep and the message pipeline with a biased `tokio::select!`. Control
//! frames (heartbeat, pong, abort) and limit rejections are answered as they
//! arrive, even while a handler is suspended. Messages are queued and
//! processed one at a time.

use std::{
    collections::VecDeque,
    sync::{Arc, atomic::Ordering},
};

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use tokio::{
    sync::mpsc,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    CLOSE_ABNORMAL,
    CLOSE_GOING_AWAY,
    CloseInfo,
    CloseSource,
    ConnectionInfo,
    event::{Event, Ingress, Work},
    pipeline::Pipeline,
};
use crate::{
    app::RouterCore,
    envelope::{Envelope, unix_millis},
    frame::Decoded,
    heartbeat::{HeartbeatAction, HeartbeatMonitor, STALE_CLOSE_CODE, STALE_CLOSE_REASON},
    metrics,
};

pub(crate) struct ConnectionActor {
    core: Arc<RouterCore>,
    conn: ConnectionInfo,
    rx: mpsc::UnboundedReceiver<Ingress>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    pipeline: Arc<Pipeline>,
    heartbeat: Option<HeartbeatMonitor>,
    sweep: Interval,
    backlog: VecDeque<Work>,
    in_flight: Option<BoxFuture<'static, ()>>,
}

impl ConnectionActor {
    pub(crate) fn new(
        core: Arc<RouterCore>,
        conn: ConnectionInfo,
        rx: mpsc::UnboundedReceiver<Ingress>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let now = Instant::now();
        let cadence = core.config.rpc_cleanup_cadence();
        let mut sweep = time::interval_at(now + cadence, cadence);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat = core
            .config
            .heartbeat
            .as_ref()
            .map(|cfg| HeartbeatMonitor::new(cfg, now));
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&core), conn.clone()));
        Self {
            core,
            conn,
            rx,
            shutdown,
            tracker,
            pipeline,
            heartbeat,
            sweep,
            backlog: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Drive the connection until it closes, then tear it down.
    pub(crate) async fn run(mut self) {
        metrics::inc_connections();
        info!(
            "connection opened: id={}, client_id={}",
            self.conn.id(),
            self.conn.client_id()
        );

        let report = self.core.hooks.run_open(&self.conn).await;
        for err in &report.errors {
            warn!("on_open hook failed: id={}, error={err}", self.conn.id());
        }
        if let Some((code, reason)) = report.close {
            self.conn.close(code, &reason);
        }

        loop {
            match self.next_event().await {
                Event::Shutdown => break,
                Event::ServerShutdown => {
                    self.conn.close(CLOSE_GOING_AWAY, "server shutting down");
                    break;
                }
                Event::Heartbeat => self.on_heartbeat(),
                Event::Sweep => {
                    self.conn.0.rpc.sweep();
                }
                Event::Settled => self.in_flight = None,
                Event::Inbound(Some(item)) => self.on_ingress(item).await,
                Event::Inbound(None) => {
                    if self.conn.0.outbound.mark_closed() {
                        self.conn.0.begin_close(CloseInfo {
                            code: CLOSE_ABNORMAL,
                            reason: "transport dropped".to_owned(),
                            source: CloseSource::Peer,
                        });
                    }
                    break;
                }
            }
            if self.in_flight.is_none()
                && let Some(work) = self.backlog.pop_front()
            {
                self.in_flight = Some(Arc::clone(&self.pipeline).process(work).boxed());
            }
        }
        self.teardown().await;
    }

    async fn next_event(&mut self) -> Event {
        let heartbeat_at = self.heartbeat.as_ref().map(HeartbeatMonitor::deadline);
        let busy = self.in_flight.is_some();

        tokio::select! {
            biased;

            () = self.conn.0.closing.cancelled() => Event::Shutdown,
            () = self.shutdown.cancelled() => Event::ServerShutdown,
            () = time::sleep_until(heartbeat_at.unwrap_or_else(Instant::now)),
                if heartbeat_at.is_some() => Event::Heartbeat,
            _ = self.sweep.tick() => Event::Sweep,
            () = Self::settle(&mut self.in_flight), if busy => Event::Settled,
            item = self.rx.recv() => Event::Inbound(item),
        }
    }

    async fn settle(in_flight: &mut Option<BoxFuture<'static, ()>>) {
        match in_flight {
            Some(fut) => fut.await,
            None => std::future::pending().await,
        }
    }

    async fn on_ingress(&mut self, item: Ingress) {
        match item {
            Ingress::Control(control) => self.on_control(control),
            Ingress::Work(work) => self.backlog.push_back(work),
            Ingress::Rejected(limit) => {
                let count = self.conn.0.rejections.swap(0, Ordering::AcqRel).max(1);
                self.pipeline.on_limit(limit, None, count).await;
            }
        }
    }

    fn on_control(&self, control: Decoded) {
        match control {
            Decoded::Heartbeat => {
                if let Err(e) = self
                    .conn
                    .0
                    .outbound
                    .send(&Envelope::heartbeat_ack(unix_millis()))
                {
                    debug!("heartbeat ack not sent: id={}, error={e}", self.conn.id());
                }
            }
            Decoded::Pong => debug!("pong received: id={}", self.conn.id()),
            Decoded::Abort(Some(correlation_id)) => {
                self.conn.0.rpc.cancel(&correlation_id);
            }
            Decoded::Abort(None) => {
                debug!("abort without correlation id ignored: id={}", self.conn.id());
            }
            Decoded::Message(_) => {}
        }
    }

    fn on_heartbeat(&mut self) {
        let Some(monitor) = self.heartbeat.as_mut() else {
            return;
        };
        monitor.observe(self.conn.0.last_inbound());
        match monitor.poll(Instant::now()) {
            HeartbeatAction::SendPing => {
                if let Err(e) = self.conn.0.outbound.send(&Envelope::ping(unix_millis())) {
                    debug!("heartbeat ping not sent: id={}, error={e}", self.conn.id());
                }
            }
            HeartbeatAction::Stale => {
                warn!("heartbeat timed out: id={}", self.conn.id());
                self.conn.close(STALE_CLOSE_CODE, STALE_CLOSE_REASON);
            }
            HeartbeatAction::Idle => {}
        }
    }

    async fn teardown(mut self) {
        // An interrupted handler keeps running to completion; cancellation is
        // cooperative.
        if let Some(fut) = self.in_flight.take() {
            self.tracker.spawn(fut);
        }
        self.rx.close();
        if !self.backlog.is_empty() {
            debug!(
                "dropping queued frames on close: id={}, count={}",
                self.conn.id(),
                self.backlog.len()
            );
            self.backlog.clear();
        }

        let info = self.conn.0.close_info().unwrap_or_else(|| CloseInfo {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
            source: CloseSource::Peer,
        });
        let cancelled = self.conn.0.rpc.cancel_all();

        let topics = self.conn.0.take_topics();
        if let Some(adapter) = self.conn.0.pubsub() {
            for topic in &topics {
                self.conn.0.outbound.socket().unsubscribe(topic);
                if let Err(e) = adapter.unsubscribe(self.conn.id(), topic).await {
                    warn!(
                        "unsubscribe on close failed: id={}, topic={topic}, error={e}",
                        self.conn.id()
                    );
                }
            }
        }

        self.core.hooks.run_close(&self.conn, &info).await;
        metrics::dec_connections();
        info!(
            "connection closed: id={}, code={}, reason={}, source={:?}, cancelled_rpcs={cancelled}",
            self.conn.id(),
            info.code,
            info.reason,
            info.source
        );
        self.conn.0.done.cancel();
    }
}
