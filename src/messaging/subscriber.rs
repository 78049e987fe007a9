// src/messaging/subscriber.rs
use std::sync::Arc;

use super::broker::BrokerClient;
use super::error::Result;
use super::registry::ClientRegistry;
use super::strategy::{ListenerHandle, ReceiverStrategy};
use super::types::{ConnectionId, ReceivedMessage};

/// Listens on one named destination.
pub struct Subscriber {
    client: Arc<dyn BrokerClient>,
    name: String,
    strategy: ReceiverStrategy,
}

impl Subscriber {
    pub fn new(client: Arc<dyn BrokerClient>, name: impl Into<String>, strategy: ReceiverStrategy) -> Self {
        Self {
            client,
            name: name.into(),
            strategy,
        }
    }

    pub async fn connect(
        registry: &ClientRegistry,
        id: &ConnectionId,
        name: impl Into<String>,
        strategy: ReceiverStrategy,
    ) -> Result<Self> {
        let client = registry.get_client(id).await?;
        Ok(Self::new(client, name, strategy))
    }

    pub fn queue(client: Arc<dyn BrokerClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, ReceiverStrategy::Queue)
    }

    pub fn topic(client: Arc<dyn BrokerClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, ReceiverStrategy::Topic)
    }

    pub fn destination(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> ReceiverStrategy {
        self.strategy
    }

    /// Start consuming in the background and return immediately.
    ///
    /// Topic subscribers must name a subscription; queue subscribers ignore it.
    /// `handler` runs once per delivery, and the message is completed only if
    /// it returns `Ok`; otherwise it goes back to the broker for redelivery.
    ///
    /// The handler is synchronous. On a multi-thread runtime it runs through
    /// `block_in_place`, so blocking work is tolerated; on a current-thread
    /// runtime it blocks every other task until it returns.
    pub fn start_listening<F>(&self, handler: F, subscription: Option<&str>) -> Result<ListenerHandle>
    where
        F: Fn(&ReceivedMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.strategy.start_listening(
            Arc::clone(&self.client),
            &self.name,
            subscription,
            Arc::new(handler),
        )
    }
}
