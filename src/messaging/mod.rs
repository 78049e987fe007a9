// src/messaging/mod.rs
// Topology-independent publish/subscribe over a broker client.
//
// Publisher / Subscriber bind a shared client (from ClientRegistry) to a
// destination name and a Queue or Topic strategy. Backends implement the
// traits in `broker`.

pub mod broker;
pub mod error;
pub mod in_memory;
pub mod publisher;
pub mod registry;
pub mod strategy;
pub mod subscriber;
pub mod types;

pub use broker::{BrokerClient, Connector, ReceiverChannel, SenderChannel};
pub use error::{BusError, Result};
pub use in_memory::{AcceptedMessage, InMemoryBroker, InMemoryClient, InMemoryConnector};
pub use publisher::Publisher;
pub use registry::ClientRegistry;
pub use strategy::{log_message, Handler, ListenerHandle, ReceiverStrategy, SenderStrategy};
pub use subscriber::Subscriber;
pub use types::{ConnectionId, DestinationKind, OutgoingMessage, ReceiveSource, ReceivedMessage};
