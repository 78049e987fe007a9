// src/rabbitmq/mod.rs
// RabbitMQ implementation of the broker boundary
//
// queue        -> durable queue, published through the default exchange
// topic        -> durable fanout exchange
// subscription -> durable queue "<topic>.<subscription>" bound to the exchange

pub mod amqp_client;
pub mod channel_manager;
mod errors;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpClient, AmqpConnector};
pub use channel_manager::{subscription_queue, AmqpReceiver, AmqpSender, ChannelConfig};
