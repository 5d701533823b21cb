//! Payload-size and pending-message ceilings.
//!
//! Both checks run at ingress, before a frame is queued. Control frames
//! never take a pending slot. A pending slot is an RAII guard: it is taken when a frame is accepted and released
//! when the guard drops, which happens on every settlement path of the
//! middleware chain, including errors and panics.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::error::WsError;

/// Which ceiling was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// A single frame exceeded `maxPayloadBytes`.
    Payload,
    /// Too many accepted but unsettled frames on one connection.
    Pending,
    /// Too many in-flight RPCs on one connection.
    RpcInflight,
}

impl LimitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Payload => "payload",
            Self::Pending => "pending",
            Self::RpcInflight => "rpc_inflight",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Details of a limit violation, handed to `on_limit_exceeded` hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitExceeded {
    pub kind: LimitKind,
    pub observed: usize,
    pub limit: usize,
}

impl LimitExceeded {
    /// The `RESOURCE_EXHAUSTED` error reported to the client.
    #[must_use]
    pub fn to_error(&self) -> WsError {
        let message = match self.kind {
            LimitKind::Payload => "payload too large",
            LimitKind::Pending => "too many pending messages",
            LimitKind::RpcInflight => "too many in-flight requests",
        };
        let err = WsError::resource_exhausted(message)
            .with_detail("limit", self.limit)
            .with_detail("observed", self.observed);
        // Resending the same oversized frame can never succeed.
        if self.kind == LimitKind::Payload {
            err.with_retryable(false)
        } else {
            err
        }
    }
}

/// Reject `len` when it exceeds `max`.
///
/// # Errors
///
/// Returns a [`LimitExceeded`] of kind [`LimitKind::Payload`].
pub fn check_payload(len: usize, max: Option<usize>) -> Result<(), LimitExceeded> {
    match max {
        Some(limit) if len > limit => Err(LimitExceeded {
            kind: LimitKind::Payload,
            observed: len,
            limit,
        }),
        _ => Ok(()),
    }
}

/// Per-connection count of accepted but unsettled frames.
#[derive(Clone, Debug, Default)]
pub struct PendingCounter(Arc<AtomicUsize>);

impl PendingCounter {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Take a slot unless `max` slots are already held.
    ///
    /// # Errors
    ///
    /// Returns a [`LimitExceeded`] of kind [`LimitKind::Pending`] when full.
    pub fn try_acquire(&self, max: Option<usize>) -> Result<PendingSlot, LimitExceeded> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match max {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            })
            .map(|_| PendingSlot(Arc::clone(&self.0)))
            .map_err(|n| LimitExceeded {
                kind: LimitKind::Pending,
                observed: n + 1,
                limit: max.unwrap_or(n),
            })
    }

    /// Slots currently held.
    #[must_use]
    pub fn current(&self) -> usize { self.0.load(Ordering::Acquire) }
}

/// A held pending slot. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping the slot releases it immediately"]
pub struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::AcqRel); }
}
