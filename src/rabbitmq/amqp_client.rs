// src/rabbitmq/amqp_client.rs
use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::channel_manager::{
    close_quietly, prepare_consumer, prepare_sender, AmqpReceiver, AmqpSender, ChannelConfig,
};
use super::errors::{connect_error, receive_error, send_error};
use crate::env::Settings;
use crate::messaging::{
    BrokerClient, BusError, ConnectionId, Connector, DestinationKind, ReceiveSource,
    ReceiverChannel, Result, SenderChannel,
};

/// Builds AMQP clients for the client registry.
pub struct AmqpConnector {
    config: ChannelConfig,
    connect_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(config: ChannelConfig, connect_timeout: Duration) -> Self {
        Self {
            config,
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            ChannelConfig {
                prefetch_count: settings.prefetch_count,
                declare_topology: settings.declare_topology,
                ..ChannelConfig::default()
            },
            settings.connect_timeout(),
        )
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, id: &ConnectionId) -> Result<Arc<dyn BrokerClient>> {
        info!(connection = %id, "Connecting to RabbitMQ");

        let connection = timeout(
            self.connect_timeout,
            Connection::connect(id.as_str(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BusError::Connect {
            endpoint: id.to_string(),
            reason: format!("timed out after {}s", self.connect_timeout.as_secs()),
        })?
        .map_err(|e| connect_error(id, &e))?;

        debug!(connection = %id, "Successfully connected to RabbitMQ");
        Ok(Arc::new(AmqpClient {
            connection,
            config: self.config.clone(),
        }))
    }
}

/// One AMQP connection. Every send and every listener gets its own channel.
pub struct AmqpClient {
    connection: Connection,
    config: ChannelConfig,
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn open_sender(
        &self,
        kind: DestinationKind,
        name: &str,
    ) -> Result<Box<dyn SenderChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| send_error(name, &e))?;

        match prepare_sender(&channel, kind, name, &self.config).await {
            Ok(route) => Ok(Box::new(AmqpSender::new(channel, kind, name, route))),
            Err(e) => {
                close_quietly(&channel, "sender setup failed").await;
                Err(send_error(name, &e))
            }
        }
    }

    async fn open_receiver(&self, source: &ReceiveSource) -> Result<Box<dyn ReceiverChannel>> {
        let entity = source.entity_path();
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| receive_error(&entity, &e))?;

        match prepare_consumer(&channel, source, &self.config).await {
            Ok(consumer) => Ok(Box::new(AmqpReceiver::new(channel, consumer, source))),
            Err(e) => {
                close_quietly(&channel, "receiver setup failed").await;
                Err(receive_error(&entity, &e))
            }
        }
    }
}
