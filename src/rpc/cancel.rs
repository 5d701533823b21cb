//! Cooperative cancellation for in-flight RPCs.

use std::sync::{Arc, Mutex};

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::panic::format_panic;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    fired: bool,
    pending: Vec<Callback>,
}

/// Cancellation flag plus an ordered list of callbacks.
///
/// Cancelling does not unwind running handler code: handlers poll
/// [`CancellationSignal::is_cancelled`], await
/// [`CancellationSignal::cancelled`], or register callbacks with
/// [`CancellationSignal::on_cancel`]. Clones share state.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    callbacks: Arc<Mutex<Callbacks>>,
}

impl CancellationSignal {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Cheap poll of the cancellation flag.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Resolve once the signal is cancelled.
    pub async fn cancelled(&self) { self.token.cancelled().await; }

    /// A child token for downstream async work started by a handler.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken { self.token.child_token() }

    /// Register `callback` to run on cancellation.
    ///
    /// Callbacks run in registration order. A callback registered after the
    /// signal fired runs immediately; one registered after the RPC replied
    /// never runs.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.callbacks.lock().expect("lock poisoned");
        if callbacks.fired {
            drop(callbacks);
            run_isolated(Box::new(callback));
            return;
        }
        callbacks.pending.push(Box::new(callback));
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub(crate) fn cancel(&self) -> bool {
        let pending = {
            let mut callbacks = self.callbacks.lock().expect("lock poisoned");
            if callbacks.fired {
                return false;
            }
            callbacks.fired = true;
            std::mem::take(&mut callbacks.pending)
        };
        self.token.cancel();
        for callback in pending {
            run_isolated(callback);
        }
        true
    }

    /// Drop pending callbacks without running them, after a terminal reply.
    pub(crate) fn disarm(&self) {
        let mut callbacks = self.callbacks.lock().expect("lock poisoned");
        callbacks.pending.clear();
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn run_isolated(callback: Callback) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("cancellation callback panicked: panic={}", format_panic(&*panic));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::CancellationSignal;

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |n: u8| {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().expect("lock").push(n)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn callbacks_run_in_order_once() {
        let signal = CancellationSignal::new();
        let (log, make) = recorder();
        signal.on_cancel(make(1));
        signal.on_cancel(make(2));
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
        assert_eq!(*log.lock().expect("lock"), vec![1, 2]);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_rest() {
        let signal = CancellationSignal::new();
        let (log, make) = recorder();
        signal.on_cancel(make(1));
        signal.on_cancel(|| panic!("cleanup failed"));
        signal.on_cancel(make(3));
        signal.cancel();
        assert_eq!(*log.lock().expect("lock"), vec![1, 3]);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let (log, make) = recorder();
        signal.on_cancel(make(9));
        assert_eq!(*log.lock().expect("lock"), vec![9]);
    }

    #[test]
    fn disarmed_callbacks_never_run() {
        let signal = CancellationSignal::new();
        let (log, make) = recorder();
        signal.on_cancel(make(1));
        signal.disarm();
        signal.cancel();
        assert!(log.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let signal = CancellationSignal::new();
        let child = signal.child_token();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel();
        waiter.await.expect("join");
        assert!(child.is_cancelled());
    }
}
