//! Broker channel abstraction (topic exchanges).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Broker channel error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker channel is not connected")]
    NotConnected,
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// The channel is gone; further publishes in this cycle will fail too.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::NotConnected)
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routing key matched against `*`/`#` patterns
    #[default]
    Topic,
    /// Routing key matched exactly
    Direct,
    /// Routing key ignored
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// Whether a binding with `pattern` receives a message sent with `routing_key`.
    pub fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Fanout => true,
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message publish properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Ask the broker to keep the message across its own restarts
    pub persistent: bool,
    /// Consumer-side deduplication key
    pub message_id: Option<String>,
    pub content_type: Option<String>,
}

impl PublishOptions {
    /// Persistent JSON message.
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            message_id: None,
            content_type: Some("application/json".to_string()),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// A broker connection able to publish to named exchanges.
///
/// The channel is owned by one publisher. `connect` is idempotent and may be
/// called again after a failure or a `close`.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Create `name` if missing. Redeclaring an existing exchange is a no-op.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Release the connection. Safe to call when not connected.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> BrokerChannel for Arc<B>
where
    B: BrokerChannel + ?Sized,
{
    async fn connect(&self) -> Result<(), BrokerError> {
        (**self).connect().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        (**self).declare_exchange(name, kind, durable).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        (**self).publish(exchange, routing_key, payload, options).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern = words(pattern);
    let key = words(routing_key);
    match_words(&pattern, &key)
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
