// src/rabbitmq/channel_manager.rs
use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Consumer, ExchangeKind,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{receive_error, send_error};
use crate::messaging::{
    BusError, DestinationKind, OutgoingMessage, ReceiveSource, ReceivedMessage, ReceiverChannel,
    Result, SenderChannel,
};

/// Configuration options for the channels a client opens
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed per receiver (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to wait for publisher confirms before a send returns
    pub confirm_mode: bool,

    /// Declare queues/exchanges if missing. When false, declarations are
    /// passive and a missing destination is an error.
    pub declare_topology: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            declare_topology: true,
        }
    }
}

/// Queue backing a topic subscription.
pub fn subscription_queue(topic: &str, subscription: &str) -> String {
    format!("{}.{}", topic, subscription)
}

pub(crate) async fn declare_queue(channel: &Channel, name: &str, config: &ChannelConfig) -> lapin::Result<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: !config.declare_topology,
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

pub(crate) async fn declare_topic(channel: &Channel, name: &str, config: &ChannelConfig) -> lapin::Result<()> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: !config.declare_topology,
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
}

/// Open the queue a receiver reads from, declaring and binding the
/// subscription queue for topics.
pub(crate) async fn prepare_consumer(
    channel: &Channel,
    source: &ReceiveSource,
    config: &ChannelConfig,
) -> lapin::Result<Consumer> {
    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await?;

    let queue = match source {
        ReceiveSource::Queue(name) => {
            declare_queue(channel, name, config).await?;
            name.clone()
        }
        ReceiveSource::Subscription {
            topic,
            subscription,
        } => {
            let queue = subscription_queue(topic, subscription);
            declare_topic(channel, topic, config).await?;
            declare_queue(channel, &queue, config).await?;
            if config.declare_topology {
                channel
                    .queue_bind(&queue, topic, "", QueueBindOptions::default(), FieldTable::default())
                    .await?;
            }
            queue
        }
    };

    let consumer_tag = format!("consumer-{}", &Uuid::new_v4().to_string()[..8]);
    debug!(queue = %queue, consumer_tag = %consumer_tag, "Starting consumer");
    channel
        .basic_consume(&queue, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
        .await
}

/// Set up a send channel; returns the (exchange, routing key) pair to publish with.
pub(crate) async fn prepare_sender(
    channel: &Channel,
    kind: DestinationKind,
    name: &str,
    config: &ChannelConfig,
) -> lapin::Result<(String, String)> {
    if config.confirm_mode {
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
    }
    match kind {
        DestinationKind::Queue => {
            declare_queue(channel, name, config).await?;
            Ok((String::new(), name.to_string()))
        }
        DestinationKind::Topic => {
            declare_topic(channel, name, config).await?;
            Ok((name.to_string(), String::new()))
        }
    }
}

/// Close a channel whose setup failed. Errors are only logged.
pub(crate) async fn close_quietly(channel: &Channel, reason: &str) {
    if channel.status().connected() {
        if let Err(e) = channel.close(200, reason).await {
            warn!(error = %e, "Failed to close channel");
        }
    }
}

pub struct AmqpSender {
    channel: Channel,
    kind: DestinationKind,
    name: String,
    exchange: String,
    routing_key: String,
    open: bool,
}

impl AmqpSender {
    pub(crate) fn new(
        channel: Channel,
        kind: DestinationKind,
        name: &str,
        (exchange, routing_key): (String, String),
    ) -> Self {
        Self {
            channel,
            kind,
            name: name.to_string(),
            exchange,
            routing_key,
            open: true,
        }
    }
}

#[async_trait]
impl SenderChannel for AmqpSender {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(message.id.clone().into())
            .with_content_type("text/plain".into())
            .with_delivery_mode(2)
            .with_timestamp(message.created_at.timestamp() as u64);

        // A queue publish that matches no queue comes back as a returned message.
        let options = BasicPublishOptions {
            mandatory: self.kind == DestinationKind::Queue,
            ..BasicPublishOptions::default()
        };

        let confirm = self
            .channel
            .basic_publish(&self.exchange, &self.routing_key, options, message.body.as_bytes(), properties)
            .await
            .map_err(|e| send_error(&self.name, &e))?;

        match confirm.await.map_err(|e| send_error(&self.name, &e))? {
            Confirmation::Nack(_) => Err(BusError::send(&self.name, "broker refused the message")),
            Confirmation::Ack(Some(_)) => Err(BusError::send(
                &self.name,
                format!("no {} named '{}' to route to", self.kind, self.name),
            )),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.open, false) || !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "sender released")
            .await
            .map_err(|e| send_error(&self.name, &e))
    }
}

pub struct AmqpReceiver {
    channel: Channel,
    consumer: Consumer,
    entity: String,
    open: bool,
}

impl AmqpReceiver {
    pub(crate) fn new(channel: Channel, consumer: Consumer, source: &ReceiveSource) -> Self {
        Self {
            channel,
            consumer,
            entity: source.entity_path(),
            open: true,
        }
    }
}

fn to_received(delivery: Delivery) -> ReceivedMessage {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| format!("delivery-{}", delivery.delivery_tag));
    let enqueued_at = delivery
        .properties
        .timestamp()
        .as_ref()
        .and_then(|ts| DateTime::from_timestamp(*ts as i64, 0));

    ReceivedMessage {
        message_id,
        body: String::from_utf8_lossy(&delivery.data).into_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        enqueued_at,
    }
}

#[async_trait]
impl ReceiverChannel for AmqpReceiver {
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(to_received(delivery))),
            Some(Err(e)) => Err(receive_error(&self.entity, &e)),
            None => Ok(None),
        }
    }

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| receive_error(&self.entity, &e))
    }

    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.channel
            .basic_nack(
                message.delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| receive_error(&self.entity, &e))
    }

    async fn close(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.open, false) || !self.channel.status().connected() {
            return Ok(());
        }
        // Unacknowledged deliveries go back to the queue when the channel closes.
        self.channel
            .close(200, "receiver released")
            .await
            .map_err(|e| receive_error(&self.entity, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_queue_name() {
        assert_eq!(subscription_queue("orders", "billing"), "orders.billing");
    }

    #[test]
    fn default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.prefetch_count, 10);
        assert!(config.confirm_mode);
        assert!(config.declare_topology);
    }
}
