//! Uniform publish/subscribe over a message broker, for both point-to-point
//! queues and fan-out topics with subscriptions.
//!
//! ```ignore
//! let registry = ClientRegistry::new(AmqpConnector::from_settings(&settings));
//! let id = settings.connection_id()?;
//!
//! let publisher = Publisher::connect(&registry, &id, "orders", SenderStrategy::Topic).await?;
//! publisher.send("Hello, Topic!").await?;
//!
//! let subscriber = Subscriber::connect(&registry, &id, "orders", ReceiverStrategy::Topic).await?;
//! let listener = subscriber.start_listening(log_message, Some("billing"))?;
//! ```

pub mod env;
pub mod messaging;
pub mod rabbitmq;

pub use env::Settings;
pub use messaging::{
    log_message, BusError, ClientRegistry, ConnectionId, ListenerHandle, Publisher,
    ReceivedMessage, ReceiverStrategy, SenderStrategy, Subscriber,
};
pub use rabbitmq::AmqpConnector;
