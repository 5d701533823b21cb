//! RPC lifecycle manager.
//!
//! Each connection owns an [`RpcTable`] tracking its in-flight RPCs. An RPC
//! moves from `pending` to exactly one of `replied`, `cancelled` or `expired`:
//!
//! - a [`Responder`] reply or error wins `replied` and sends the only terminal
//!   frame; later attempts are logged no-ops;
//! - a client abort or the connection closing wins `cancelled` and runs the
//!   cancellation callbacks;
//! - the idle sweep wins `expired` for RPCs with no activity for the idle
//!   timeout.
//!
//! Replied correlation ids are kept in a [`DedupLedger`] so retries within
//! the window are rejected with `ALREADY_EXISTS`.

pub mod cancel;
pub mod dedup;
mod responder;
pub mod state;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use cancel::CancellationSignal;
pub use dedup::DedupLedger;
use log::{debug, warn};
pub use responder::Responder;
pub use state::{RpcPhase, RpcState};
use tokio::time::Instant;

use crate::{
    config::RouterConfig,
    error::WsError,
    limits::{LimitExceeded, LimitKind},
    metrics,
};

/// Timing and ceilings applied to RPCs on one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcSettings {
    pub default_timeout: Duration,
    pub idle_timeout: Duration,
    pub dedup_window: Duration,
    pub max_inflight: Option<usize>,
}

impl From<&RouterConfig> for RpcSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            default_timeout: config.rpc_timeout(),
            idle_timeout: config.rpc_idle_timeout(),
            dedup_window: config.rpc_dedup_window(),
            max_inflight: config.rpc_max_inflight_per_socket,
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self { Self::from(&RouterConfig::default()) }
}

/// Why an inbound RPC was not accepted.
#[derive(Debug, Clone)]
pub enum AcceptError {
    /// The request itself is unacceptable.
    Rejected(WsError),
    /// The in-flight ceiling was hit.
    Limit(LimitExceeded),
}

impl AcceptError {
    /// Error reported to the client.
    #[must_use]
    pub fn to_error(&self) -> WsError {
        match self {
            Self::Rejected(err) => err.clone(),
            Self::Limit(limit) => limit.to_error(),
        }
    }
}

/// In-flight RPCs and the dedup ledger for one connection.
#[derive(Debug)]
pub struct RpcTable {
    settings: RpcSettings,
    inflight: Mutex<HashMap<String, Arc<RpcState>>>,
    ledger: Mutex<DedupLedger>,
}

impl RpcTable {
    #[must_use]
    pub fn new(settings: RpcSettings) -> Self {
        Self {
            settings,
            inflight: Mutex::new(HashMap::new()),
            ledger: Mutex::new(DedupLedger::new(settings.dedup_window)),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RpcSettings { &self.settings }

    /// Accept a new RPC received at `received_at`.
    ///
    /// The deadline is `received_at` plus the client's `timeoutMs`, or the
    /// default timeout when the client sent none.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Rejected`] with `INVALID_ARGUMENT` when the
    /// correlation id is missing and `ALREADY_EXISTS` when it is in flight or
    /// in the ledger; [`AcceptError::Limit`] when the in-flight ceiling is hit.
    pub fn accept(
        &self,
        correlation_id: Option<String>,
        response_type: &str,
        client_timeout_ms: Option<u64>,
        received_at: Instant,
    ) -> Result<Arc<RpcState>, AcceptError> {
        let Some(correlation_id) = correlation_id else {
            return Err(AcceptError::Rejected(WsError::invalid_argument(
                "rpc request requires meta.correlationId",
            )));
        };
        if self
            .ledger
            .lock()
            .expect("lock poisoned")
            .contains(&correlation_id, Instant::now())
        {
            return Err(AcceptError::Rejected(
                WsError::already_exists("request already answered")
                    .with_detail("correlationId", correlation_id),
            ));
        }

        let mut inflight = self.inflight.lock().expect("lock poisoned");
        if inflight.contains_key(&correlation_id) {
            return Err(AcceptError::Rejected(
                WsError::already_exists("request already in flight")
                    .with_detail("correlationId", correlation_id),
            ));
        }
        if let Some(limit) = self.settings.max_inflight
            && inflight.len() >= limit
        {
            return Err(AcceptError::Limit(LimitExceeded {
                kind: LimitKind::RpcInflight,
                observed: inflight.len() + 1,
                limit,
            }));
        }

        let timeout = client_timeout_ms.map_or(self.settings.default_timeout, Duration::from_millis);
        let state = Arc::new(RpcState::new(
            correlation_id.clone(),
            response_type.to_owned(),
            received_at,
            timeout,
        ));
        inflight.insert(correlation_id, Arc::clone(&state));
        Ok(state)
    }

    #[must_use]
    pub fn get(&self, correlation_id: &str) -> Option<Arc<RpcState>> {
        self.inflight
            .lock()
            .expect("lock poisoned")
            .get(correlation_id)
            .cloned()
    }

    /// Number of RPCs still pending.
    #[must_use]
    pub fn inflight(&self) -> usize { self.inflight.lock().expect("lock poisoned").len() }

    /// Whether `correlation_id` was answered within the dedup window.
    #[must_use]
    pub fn was_answered(&self, correlation_id: &str) -> bool {
        self.ledger
            .lock()
            .expect("lock poisoned")
            .contains(correlation_id, Instant::now())
    }

    /// Bookkeeping after `state` won the `replied` transition.
    pub(crate) fn complete(&self, state: &RpcState) {
        state.signal().disarm();
        self.remove(state.correlation_id());
        self.ledger
            .lock()
            .expect("lock poisoned")
            .record(state.correlation_id(), Instant::now());
        metrics::inc_rpc_terminal(RpcPhase::Replied);
    }

    /// Cancel the RPC with `correlation_id`. Returns `false` if none was
    /// pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let Some(state) = self.get(correlation_id) else {
            debug!("abort for unknown rpc ignored: correlation_id={correlation_id}");
            return false;
        };
        self.terminate(&state, RpcPhase::Cancelled)
    }

    /// Cancel every pending RPC, as on connection close.
    pub fn cancel_all(&self) -> usize {
        let states: Vec<Arc<RpcState>> = self
            .inflight
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        states
            .iter()
            .filter(|state| self.terminate(state, RpcPhase::Cancelled))
            .count()
    }

    /// Expire RPCs idle for longer than the idle timeout.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.settings.idle_timeout;
        let stale: Vec<Arc<RpcState>> = self
            .inflight
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|state| now.saturating_duration_since(state.idle_since()) >= idle)
            .cloned()
            .collect();
        let expired = stale
            .iter()
            .filter(|state| self.terminate(state, RpcPhase::Expired))
            .count();
        if expired > 0 {
            warn!("expired idle rpcs: count={expired}, idle_timeout_ms={}", idle.as_millis());
        }
        expired
    }

    fn terminate(&self, state: &RpcState, phase: RpcPhase) -> bool {
        if !state.settle(phase) {
            return false;
        }
        self.remove(state.correlation_id());
        debug!(
            "rpc terminated: correlation_id={}, phase={}",
            state.correlation_id(),
            phase.as_str()
        );
        metrics::inc_rpc_terminal(phase);
        state.signal().cancel();
        true
    }

    fn remove(&self, correlation_id: &str) {
        self.inflight
            .lock()
            .expect("lock poisoned")
            .remove(correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use rstest::{fixture, rstest};
    use tokio::time::{self, Instant};

    use super::{AcceptError, RpcPhase, RpcSettings, RpcTable};
    use crate::{error::ErrorCode, limits::LimitKind};

    #[fixture]
    fn table() -> RpcTable {
        RpcTable::new(RpcSettings {
            default_timeout: Duration::from_millis(1_000),
            idle_timeout: Duration::from_millis(2_000),
            dedup_window: Duration::from_secs(60),
            max_inflight: Some(2),
        })
    }

    fn rejected_code(err: AcceptError) -> ErrorCode {
        match err {
            AcceptError::Rejected(e) => e.code().clone(),
            AcceptError::Limit(l) => panic!("unexpected limit {l:?}"),
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn client_timeout_overrides_default(table: RpcTable) {
        let now = Instant::now();
        let default = table.accept(Some("a".into()), "R", None, now).expect("accept");
        let custom = table.accept(Some("b".into()), "R", Some(250), now).expect("accept");
        assert_eq!(default.deadline() - now, Duration::from_millis(1_000));
        assert_eq!(custom.deadline() - now, Duration::from_millis(250));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn missing_and_duplicate_ids_are_rejected(table: RpcTable) {
        let now = Instant::now();
        let err = table.accept(None, "R", None, now).expect_err("missing id");
        assert_eq!(rejected_code(err), ErrorCode::InvalidArgument);
        let state = table.accept(Some("a".into()), "R", None, now).expect("accept");
        let err = table.accept(Some("a".into()), "R", None, now).expect_err("in flight");
        assert_eq!(rejected_code(err), ErrorCode::AlreadyExists);

        assert!(state.settle(RpcPhase::Replied));
        table.complete(&state);
        assert_eq!(table.inflight(), 0);
        assert!(table.was_answered("a"));
        let err = table.accept(Some("a".into()), "R", None, now).expect_err("answered");
        assert_eq!(rejected_code(err), ErrorCode::AlreadyExists);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn inflight_ceiling(table: RpcTable) {
        let now = Instant::now();
        table.accept(Some("a".into()), "R", None, now).expect("a");
        table.accept(Some("b".into()), "R", None, now).expect("b");
        match table.accept(Some("c".into()), "R", None, now) {
            Err(AcceptError::Limit(limit)) => assert_eq!(limit.kind, LimitKind::RpcInflight),
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn cancel_runs_callbacks_and_blocks_reply(table: RpcTable) {
        let state = table
            .accept(Some("a".into()), "R", None, Instant::now())
            .expect("accept");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        state.signal().on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!state.settle(RpcPhase::Replied));
        assert!(!table.was_answered("a"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_idle_rpcs(table: RpcTable) {
        let old = table
            .accept(Some("old".into()), "R", None, Instant::now())
            .expect("accept");
        time::advance(Duration::from_millis(1_500)).await;
        let fresh = table
            .accept(Some("fresh".into()), "R", None, Instant::now())
            .expect("accept");
        time::advance(Duration::from_millis(600)).await;
        assert_eq!(table.sweep(), 1);
        assert_eq!(old.phase(), RpcPhase::Expired);
        assert!(old.signal().is_cancelled());
        assert!(fresh.is_pending());

        fresh.touch();
        time::advance(Duration::from_millis(1_999)).await;
        assert_eq!(table.sweep(), 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn cancel_all_settles_everything(table: RpcTable) {
        let now = Instant::now();
        let a = table.accept(Some("a".into()), "R", None, now).expect("a");
        let b = table.accept(Some("b".into()), "R", None, now).expect("b");
        assert!(a.settle(RpcPhase::Replied));
        table.complete(&a);
        assert_eq!(table.cancel_all(), 1);
        assert_eq!(b.phase(), RpcPhase::Cancelled);
        assert_eq!(table.inflight(), 0);
    }
}
