//! Pub/Sub capability.
//!
//! The router only calls a [`PubSubAdapter`]; delivering published envelopes
//! to subscribers is the adapter's job. [`MemoryPubSub`] tracks subscriptions
//! in process and reports how many connections a publish matched.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::{
    envelope::Envelope,
    error::{ErrorCode, WsError},
};

/// Longest accepted topic name.
pub const MAX_TOPIC_LEN: usize = 128;

/// Check a topic name: non-empty, at most [`MAX_TOPIC_LEN`] characters of
/// `[A-Za-z0-9:_\-./]`.
///
/// # Errors
///
/// Returns `INVALID_ARGUMENT` naming the topic.
pub fn validate_topic(topic: &str) -> Result<(), WsError> {
    let reason = if topic.is_empty() {
        "topic must not be empty"
    } else if topic.chars().count() > MAX_TOPIC_LEN {
        "topic too long"
    } else if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/'))
    {
        "topic contains invalid characters"
    } else {
        return Ok(());
    };
    Err(WsError::invalid_argument(reason).with_detail("topic", topic))
}

/// Options for one publish.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishOptions {
    pub topic: String,
    /// Connection that should not receive its own publish.
    pub exclude_connection: Option<String>,
    pub partition_key: Option<String>,
    /// Extra meta merged into the published envelope.
    pub meta: Map<String, Value>,
}

impl PublishOptions {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn excluding(mut self, connection_id: impl Into<String>) -> Self {
        self.exclude_connection = Some(connection_id.into());
        self
    }
}

/// Adapter's answer to a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishResult {
    pub ok: bool,
    pub matched: Option<usize>,
    pub error: Option<ErrorCode>,
    pub retryable: Option<bool>,
}

impl PublishResult {
    #[must_use]
    pub fn delivered(matched: usize) -> Self {
        Self {
            ok: true,
            matched: Some(matched),
            error: None,
            retryable: None,
        }
    }

    #[must_use]
    pub fn failed(code: ErrorCode, retryable: bool) -> Self {
        Self {
            ok: false,
            matched: None,
            error: Some(code),
            retryable: Some(retryable),
        }
    }

    /// Convert a failed result into an error for the caller.
    ///
    /// # Errors
    ///
    /// Returns the adapter's code, `UNAVAILABLE` if it gave none.
    pub fn into_result(self) -> Result<Option<usize>, WsError> {
        if self.ok {
            return Ok(self.matched);
        }
        let code = self.error.unwrap_or(ErrorCode::Unavailable);
        let err = WsError::new(code, "publish failed");
        Err(match self.retryable {
            Some(retryable) => err.with_retryable(retryable),
            None => err,
        })
    }
}

/// Callback receiving envelopes published elsewhere in a cluster.
pub type RemoteSink = Arc<dyn Fn(String, Envelope) + Send + Sync>;

/// Subscription store and publish transport.
#[async_trait]
pub trait PubSubAdapter: Send + Sync + 'static {
    async fn publish(&self, envelope: &Envelope, options: &PublishOptions) -> PublishResult;

    /// # Errors
    ///
    /// Adapter-defined.
    async fn subscribe(&self, connection_id: &str, topic: &str) -> Result<(), WsError>;

    /// # Errors
    ///
    /// Adapter-defined.
    async fn unsubscribe(&self, connection_id: &str, topic: &str) -> Result<(), WsError>;

    /// Replace the whole subscription set of `connection_id`.
    ///
    /// # Errors
    ///
    /// The first failing subscribe or unsubscribe.
    async fn replace(&self, connection_id: &str, topics: &[String]) -> Result<(), WsError> {
        let current = self.list_topics(connection_id).await;
        for topic in current.iter().filter(|t| !topics.contains(t)) {
            self.unsubscribe(connection_id, topic).await?;
        }
        for topic in topics.iter().filter(|t| !current.contains(t)) {
            self.subscribe(connection_id, topic).await?;
        }
        Ok(())
    }

    async fn list_topics(&self, connection_id: &str) -> Vec<String>;

    async fn has_topic(&self, connection_id: &str, topic: &str) -> bool {
        self.list_topics(connection_id)
            .await
            .iter()
            .any(|t| t == topic)
    }

    /// Begin receiving remote publishes.
    ///
    /// # Errors
    ///
    /// Adapter-defined.
    async fn start(&self, _on_remote: RemoteSink) -> Result<(), WsError> { Ok(()) }

    /// # Errors
    ///
    /// Adapter-defined.
    async fn close(&self) -> Result<(), WsError> { Ok(()) }
}

/// In-process subscription registry. Publishing counts matches but delivers
/// nothing.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: DashMap<String, BTreeSet<String>>,
}

impl MemoryPubSub {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of connections subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

#[async_trait]
impl PubSubAdapter for MemoryPubSub {
    async fn publish(&self, _envelope: &Envelope, options: &PublishOptions) -> PublishResult {
        if let Err(err) = validate_topic(&options.topic) {
            return PublishResult::failed(err.code().clone(), false);
        }
        let matched = self.topics.get(&options.topic).map_or(0, |subs| {
            subs.iter()
                .filter(|id| options.exclude_connection.as_deref() != Some(id.as_str()))
                .count()
        });
        PublishResult::delivered(matched)
    }

    async fn subscribe(&self, connection_id: &str, topic: &str) -> Result<(), WsError> {
        validate_topic(topic)?;
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .insert(connection_id.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, connection_id: &str, topic: &str) -> Result<(), WsError> {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(connection_id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
        Ok(())
    }

    async fn list_topics(&self, connection_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().contains(connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort_unstable();
        topics
    }

    async fn has_topic(&self, connection_id: &str, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subs| subs.contains(connection_id))
    }
}
