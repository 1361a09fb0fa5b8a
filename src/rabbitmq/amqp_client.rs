// src/rabbitmq/amqp_client.rs
//! lapin implementation of the broker seam.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, ChannelPtr, ConnectionPtr, Delivery,
    DeliveryStream, ExchangeInfo, ExchangeOptions, ExchangeType, MessageProperties, QueueInfo,
    QueueOptions,
};
use super::errors::{RabbitMQError, Result};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Connects to a real AMQP 0-9-1 broker through lapin.
#[derive(Clone, Default)]
pub struct LapinBroker {
    properties: ConnectionProperties,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, uri: &str) -> Result<ConnectionPtr> {
        let connection = Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        info!("Connected to RabbitMQ");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<ChannelPtr> {
        let channel = self.connection.create_channel().await?;

        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        info!("Closing RabbitMQ connection gracefully");
        Ok(self.connection.close(200, "Normal shutdown").await?)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeOptions,
    ) -> Result<ExchangeInfo> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare exchange {}: {}", name, e))
            })?;

        Ok(ExchangeInfo {
            name: name.to_string(),
        })
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare queue {}: {}", name, e))
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to bind {} to {} ({}): {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        debug!(queue, consumer_tag, "Started consuming");
        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(from_lapin_delivery)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        Ok(self.channel.basic_qos(count, BasicQosOptions::default()).await?)
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        Ok(self.channel.close(200, "Normal shutdown").await?)
    }

    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(content_encoding) = properties.content_encoding {
        basic = basic.with_content_encoding(content_encoding.into());
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_lapin_delivery(delivery: LapinDelivery) -> Delivery {
    let props = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let properties = MessageProperties {
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        message_id: text(props.message_id()),
        timestamp: *props.timestamp(),
    };
    let delivery_count = props.headers().as_ref().and_then(delivery_count);

    Delivery::new(
        delivery.data,
        properties,
        delivery.redelivered,
        delivery_count,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    let count = match value {
        AMQPValue::ShortShortUInt(v) => u64::from(*v),
        AMQPValue::ShortUInt(v) => u64::from(*v),
        AMQPValue::LongUInt(v) => u64::from(*v),
        AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::ShortInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::LongInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok()?,
        _ => return None,
    };
    Some(u32::try_from(count).unwrap_or(u32::MAX))
}
