//! State of one in-flight RPC.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use super::cancel::CancellationSignal;

/// Lifecycle phase. Every phase but `Pending` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcPhase {
    Pending = 0,
    Replied = 1,
    Cancelled = 2,
    Expired = 3,
}

impl RpcPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Replied,
            2 => Self::Cancelled,
            _ => Self::Expired,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replied => "replied",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// One accepted RPC.
///
/// The phase lives in a single atomic and only changes through
/// [`RpcState::settle`], so at most one terminal transition ever succeeds.
#[derive(Debug)]
pub struct RpcState {
    correlation_id: String,
    response_type: String,
    received_at: Instant,
    deadline: Instant,
    last_activity: Mutex<Instant>,
    phase: AtomicU8,
    signal: CancellationSignal,
}

impl RpcState {
    pub(crate) fn new(
        correlation_id: String,
        response_type: String,
        received_at: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            correlation_id,
            response_type,
            received_at,
            deadline: received_at + timeout,
            last_activity: Mutex::new(received_at),
            phase: AtomicU8::new(RpcPhase::Pending as u8),
            signal: CancellationSignal::new(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str { &self.correlation_id }

    #[must_use]
    pub fn response_type(&self) -> &str { &self.response_type }

    #[must_use]
    pub fn received_at(&self) -> Instant { self.received_at }

    /// Advisory deadline fixed at acceptance.
    #[must_use]
    pub fn deadline(&self) -> Instant { self.deadline }

    /// Time left until the deadline, never negative.
    #[must_use]
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn phase(&self) -> RpcPhase { RpcPhase::from_u8(self.phase.load(Ordering::Acquire)) }

    #[must_use]
    pub fn is_pending(&self) -> bool { self.phase() == RpcPhase::Pending }

    #[must_use]
    pub fn signal(&self) -> &CancellationSignal { &self.signal }

    /// Check-and-set from `Pending` to the terminal phase `to`.
    ///
    /// Returns `false` if another transition already won.
    pub(crate) fn settle(&self, to: RpcPhase) -> bool {
        debug_assert_ne!(to, RpcPhase::Pending);
        self.phase
            .compare_exchange(
                RpcPhase::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn touch(&self) { *self.last_activity.lock().expect("lock poisoned") = Instant::now(); }

    pub(crate) fn idle_since(&self) -> Instant { *self.last_activity.lock().expect("lock poisoned") }
}
