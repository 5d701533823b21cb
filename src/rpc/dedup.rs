//! Rolling window of answered correlation ids.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::time::Instant;

/// Remembers completed correlation ids for `window` so client retries of an
/// already-answered request can be rejected without re-running the handler.
#[derive(Debug)]
pub struct DedupLedger {
    window: Duration,
    completed: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupLedger {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            completed: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `correlation_id` as completed at `now`.
    pub fn record(&mut self, correlation_id: &str, now: Instant) {
        self.prune(now);
        self.completed.insert(correlation_id.to_owned(), now);
        self.order.push_back((correlation_id.to_owned(), now));
    }

    /// Whether `correlation_id` completed within the window ending at `now`.
    pub fn contains(&mut self, correlation_id: &str, now: Instant) -> bool {
        self.prune(now);
        self.completed.contains_key(correlation_id)
    }

    #[must_use]
    pub fn len(&self) -> usize { self.completed.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.completed.is_empty() }

    fn prune(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            // A newer record for the same id keeps the entry alive.
            if self.completed.get(id) == Some(at) {
                self.completed.remove(id);
            }
            self.order.pop_front();
        }
    }
}
