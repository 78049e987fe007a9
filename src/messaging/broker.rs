// src/messaging/broker.rs
// The broker client boundary. Backends (AMQP, in-memory) implement these.

use async_trait::async_trait;
use std::sync::Arc;

use super::error::Result;
use super::types::{ConnectionId, DestinationKind, OutgoingMessage, ReceiveSource, ReceivedMessage};

/// Builds broker clients from connection identifiers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, id: &ConnectionId) -> Result<Arc<dyn BrokerClient>>;
}

/// One logical connection to the broker, shared by every publisher and
/// subscriber bound to the same identifier.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn open_sender(
        &self,
        kind: DestinationKind,
        name: &str,
    ) -> Result<Box<dyn SenderChannel>>;

    async fn open_receiver(&self, source: &ReceiveSource) -> Result<Box<dyn ReceiverChannel>>;
}

#[async_trait]
pub trait SenderChannel: Send {
    /// Resolves once the broker has accepted the message.
    async fn send(&mut self, message: &OutgoingMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ReceiverChannel: Send {
    /// Waits for the next message. `Ok(None)` means the broker closed the stream.
    ///
    /// Must be cancel safe: dropping the future before it resolves loses no message.
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>>;

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()>;

    /// Hands an uncompleted message back to the broker so it is delivered again.
    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<()>;

    /// Releases the channel. Messages that were never completed become
    /// eligible for redelivery.
    async fn close(&mut self) -> Result<()>;
}
