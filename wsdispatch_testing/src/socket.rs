//! In-memory platform socket.

use std::{
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::Notify;
use wsdispatch::{PlatformSocket, socket::SocketError};

/// How long the `wait_for_*` helpers wait before failing the test.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Socket recording every sent frame and the close call.
#[derive(Debug, Default)]
pub struct RecordingSocket {
    frames: Mutex<Vec<String>>,
    closed: Mutex<Option<(u16, String)>>,
    topics: Mutex<Vec<String>>,
    buffered: AtomicUsize,
    reject_sends: AtomicBool,
    notify: Notify,
}

impl RecordingSocket {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Raw text frames in send order.
    pub fn raw_frames(&self) -> Vec<String> { self.frames.lock().expect("lock poisoned").clone() }

    /// Sent frames parsed as JSON.
    pub fn frames(&self) -> Vec<Value> {
        self.raw_frames()
            .iter()
            .map(|f| serde_json::from_str(f).expect("router sent invalid JSON"))
            .collect()
    }

    /// Sent frames whose `type` is `message_type`.
    pub fn frames_of_type(&self, message_type: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["type"] == message_type)
            .collect()
    }

    /// Code and reason of the close call, if any.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.closed.lock().expect("lock poisoned").clone()
    }

    /// Topics currently subscribed through the native hooks.
    pub fn native_topics(&self) -> Vec<String> { self.topics.lock().expect("lock poisoned").clone() }

    /// Pretend `bytes` are queued in the socket buffer.
    pub fn set_buffered_amount(&self, bytes: usize) { self.buffered.store(bytes, Ordering::SeqCst); }

    /// Make every later send fail.
    pub fn reject_sends(&self) { self.reject_sends.store(true, Ordering::SeqCst); }

    /// Wait until at least `count` frames were sent and return all of them.
    ///
    /// # Panics
    ///
    /// Panics if the frames do not arrive within [`WAIT_LIMIT`].
    pub async fn wait_for_frames(&self, count: usize) -> Vec<Value> {
        self.wait_until(|s| s.frames.lock().expect("lock poisoned").len() >= count)
            .await;
        self.frames()
    }

    /// Wait for the close call.
    ///
    /// # Panics
    ///
    /// Panics if the socket is not closed within [`WAIT_LIMIT`].
    pub async fn wait_for_close(&self) -> (u16, String) {
        self.wait_until(|s| s.closed.lock().expect("lock poisoned").is_some())
            .await;
        self.close_frame().expect("close recorded")
    }

    async fn wait_until(&self, ready: impl Fn(&Self) -> bool) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if ready(self) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_LIMIT, wait)
            .await
            .expect("timed out waiting on socket");
    }
}

impl PlatformSocket for RecordingSocket {
    fn send(&self, frame: &str) -> Result<(), SocketError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(SocketError::Failed("send rejected".into()));
        }
        self.frames
            .lock()
            .expect("lock poisoned")
            .push(frame.to_owned());
        self.notify.notify_waiters();
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        *self.closed.lock().expect("lock poisoned") = Some((code, reason.to_owned()));
        self.notify.notify_waiters();
    }

    fn buffered_amount(&self) -> usize { self.buffered.load(Ordering::SeqCst) }

    fn subscribe(&self, topic: &str) {
        self.topics
            .lock()
            .expect("lock poisoned")
            .push(topic.to_owned());
    }

    fn unsubscribe(&self, topic: &str) {
        self.topics
            .lock()
            .expect("lock poisoned")
            .retain(|t| t != topic);
    }
}
