// src/messaging/types.rs
use chrono::{DateTime, Utc};
use std::fmt;
use url::Url;
use uuid::Uuid;

use super::error::{BusError, Result};

/// Identifies one logical broker connection, e.g. an AMQP URI.
///
/// Display and Debug never print the password of URI-style identifiers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rewrites the URI path so the connection targets `namespace`
    /// (an AMQP virtual host).
    pub fn with_namespace(&self, namespace: &str) -> Result<Self> {
        let mut url = Url::parse(&self.0).map_err(|e| {
            BusError::configuration(format!(
                "cannot apply namespace '{}' to {}: {}",
                namespace,
                self.redacted(),
                e
            ))
        })?;
        url.set_path(&format!("/{}", namespace.trim_start_matches('/')));
        Ok(Self(url.to_string()))
    }

    pub fn redacted(&self) -> String {
        match Url::parse(&self.0) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<opaque connection string>".to_string(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionId").field(&self.redacted()).finish()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Which kind of destination a send-channel is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => f.write_str("queue"),
            DestinationKind::Topic => f.write_str("topic"),
        }
    }
}

/// Where a receive-channel reads from. A topic can only be consumed
/// through one of its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReceiveSource {
    Queue(String),
    Subscription { topic: String, subscription: String },
}

impl ReceiveSource {
    /// Broker-side path of the entity messages are read from.
    pub fn entity_path(&self) -> String {
        match self {
            ReceiveSource::Queue(name) => name.clone(),
            ReceiveSource::Subscription {
                topic,
                subscription,
            } => format!("{}/subscriptions/{}", topic, subscription),
        }
    }
}

impl fmt::Display for ReceiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_path())
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// A message delivered to a receive-channel, pending acknowledgment.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// Channel-scoped tag used to complete the message.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}
