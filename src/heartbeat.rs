//! Heartbeat monitor.
//!
//! Tracks inbound activity for one connection. After `interval` of silence
//! the connection actor sends a `__ping` and the monitor arms a `timeout`
//! watchdog; any inbound traffic disarms it and restarts the interval.
//! Missing the watchdog marks the connection stale.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatConfig;

/// Close code sent when the heartbeat watchdog fires.
pub const STALE_CLOSE_CODE: u16 = 4000;
/// Close reason sent when the heartbeat watchdog fires.
pub const STALE_CLOSE_REASON: &str = "heartbeat timeout";

/// What the actor should do when the monitor's deadline passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping; the watchdog is now armed.
    SendPing,
    /// The watchdog expired; close the connection.
    Stale,
    /// Activity moved the deadline; nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(config: &HeartbeatConfig, now: Instant) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            last_activity: now,
            ping_sent_at: None,
        }
    }

    /// Record inbound traffic, resetting schedule and watchdog.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent_at = None;
    }

    /// Fold in activity seen elsewhere; older instants are ignored.
    pub fn observe(&mut self, seen: Instant) {
        if seen > self.last_activity {
            self.touch(seen);
        }
    }

    #[must_use]
    pub fn is_awaiting_pong(&self) -> bool { self.ping_sent_at.is_some() }

    /// Instant at which [`HeartbeatMonitor::poll`] next has work.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        match self.ping_sent_at {
            Some(sent) => sent + self.timeout,
            None => self.last_activity + self.interval,
        }
    }

    /// Advance the monitor to `now`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if now < self.deadline() {
            return HeartbeatAction::Idle;
        }
        if self.ping_sent_at.is_some() {
            HeartbeatAction::Stale
        } else {
            self.ping_sent_at = Some(now);
            HeartbeatAction::SendPing
        }
    }
}
