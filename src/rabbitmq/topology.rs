// src/rabbitmq/topology.rs
use std::sync::Arc;

use tracing::debug;

use super::broker::{ExchangeInfo, ExchangeOptions, ExchangeType, QueueInfo, QueueOptions};
use super::channel_manager::ChannelVault;
use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub options: ExchangeOptions,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            options: ExchangeOptions::default(),
        }
    }

    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub options: QueueOptions,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    /// Survives broker restarts, kept when nobody consumes.
    pub fn durable(name: impl Into<String>) -> Self {
        Self::new(
            name,
            QueueOptions {
                durable: true,
                ..QueueOptions::default()
            },
        )
    }

    /// Per-call reply queue, gone once its consumer leaves.
    pub fn exclusive_reply(name: impl Into<String>) -> Self {
        Self::new(
            name,
            QueueOptions {
                durable: false,
                exclusive: false,
                auto_delete: true,
            },
        )
    }
}

/// Declares exchanges, queues and bindings.
///
/// Declarations are broker-native and therefore idempotent; redeclaring an
/// entity with different options is a `TopologyError`.
pub struct TopologyAsserter {
    vault: Arc<ChannelVault>,
}

impl TopologyAsserter {
    pub fn new(vault: Arc<ChannelVault>) -> Self {
        Self { vault }
    }

    pub async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<ExchangeInfo> {
        let channel = self.vault.get_channel(&spec.name).await?;
        let info = channel
            .declare_exchange(&spec.name, spec.kind, spec.options)
            .await
            .map_err(|e| topology_error("exchange", &spec.name, e))?;

        debug!(exchange = %spec.name, kind = %spec.kind, "Asserted exchange");
        Ok(info)
    }

    pub async fn assert_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let channel = self.vault.get_channel(&spec.name).await?;
        let info = channel
            .declare_queue(&spec.name, spec.options)
            .await
            .map_err(|e| topology_error("queue", &spec.name, e))?;

        debug!(
            queue = %info.name,
            messages = info.message_count,
            consumers = info.consumer_count,
            "Asserted queue"
        );
        Ok(info)
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.vault.get_channel(queue).await?;
        channel
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(|e| topology_error("binding for", queue, e))?;

        debug!(queue, exchange, routing_key, "Bound queue");
        Ok(())
    }
}

fn topology_error(what: &str, name: &str, error: RabbitMQError) -> RabbitMQError {
    match error {
        RabbitMQError::TopologyError(_) | RabbitMQError::ConnectionError(_) => error,
        other => RabbitMQError::TopologyError(format!("{} '{}': {}", what, name, other)),
    }
}
