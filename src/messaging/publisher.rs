// src/messaging/publisher.rs
use std::sync::Arc;

use super::broker::BrokerClient;
use super::error::Result;
use super::registry::ClientRegistry;
use super::strategy::SenderStrategy;
use super::types::ConnectionId;

/// Sends messages to one named destination.
pub struct Publisher {
    client: Arc<dyn BrokerClient>,
    name: String,
    strategy: SenderStrategy,
}

impl Publisher {
    pub fn new(client: Arc<dyn BrokerClient>, name: impl Into<String>, strategy: SenderStrategy) -> Self {
        Self {
            client,
            name: name.into(),
            strategy,
        }
    }

    /// Bind to `name` using the registry's client for `id`.
    pub async fn connect(
        registry: &ClientRegistry,
        id: &ConnectionId,
        name: impl Into<String>,
        strategy: SenderStrategy,
    ) -> Result<Self> {
        let client = registry.get_client(id).await?;
        Ok(Self::new(client, name, strategy))
    }

    pub fn queue(client: Arc<dyn BrokerClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, SenderStrategy::Queue)
    }

    pub fn topic(client: Arc<dyn BrokerClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, SenderStrategy::Topic)
    }

    pub fn destination(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> SenderStrategy {
        self.strategy
    }

    /// Send one message; resolves once the broker has accepted it.
    pub async fn send(&self, content: &str) -> Result<()> {
        self.strategy
            .send(self.client.as_ref(), &self.name, content)
            .await
    }
}
