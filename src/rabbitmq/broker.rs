// src/rabbitmq/broker.rs
//! Broker seam.
//!
//! Everything above this module talks to the broker only through the three
//! traits defined here. `amqp_client` implements them on top of lapin and
//! `memory` implements them in-process for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::errors::Result;

pub type BrokerPtr = Arc<dyn Broker>;
pub type ConnectionPtr = Arc<dyn BrokerConnection>;
pub type ChannelPtr = Arc<dyn BrokerChannel>;

/// Stream of inbound deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<ConnectionPtr>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<ChannelPtr>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeOptions,
    ) -> Result<ExchangeInfo>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stops the consumer registered under `consumer_tag`; its stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The subset of AMQP basic properties the RPC layer reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    /// Broker-maintained delivery count (`x-delivery-count`), when the
    /// queue type provides one.
    pub delivery_count: Option<u32>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        delivery_count: Option<u32>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            data,
            properties,
            redelivered,
            delivery_count,
            acker,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.data.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
