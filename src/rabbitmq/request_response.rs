// src/rabbitmq/request_response.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::MessageProperties;
use super::channel_manager::ChannelVault;
use super::codec::{self, PayloadCodec};
use super::correlation::{CorrelationId, ResponseCallback};
use super::errors::{RabbitMQError, Result};
use super::topology::{QueueSpec, TopologyAsserter};
use crate::config::Settings;

/// Name of the reply queue shared by every caller of `exchange`.
pub fn shared_reply_queue(exchange: &str) -> String {
    format!("{}.return", exchange)
}

fn exclusive_reply_queue(exchange: &str) -> String {
    format!("{}.return.{}", exchange, Uuid::new_v4())
}

/// Properties stamped on everything this crate publishes.
pub(crate) fn message_properties(codec: &dyn PayloadCodec) -> MessageProperties {
    MessageProperties {
        content_type: Some(codec.content_type().to_string()),
        content_encoding: Some(codec.content_encoding().to_string()),
        message_id: Some(Uuid::new_v4().to_string()),
        timestamp: u64::try_from(Utc::now().timestamp()).ok(),
        ..MessageProperties::default()
    }
}

/// A request to send, built with `RpcCall::new` and the chained setters.
#[derive(Debug)]
pub struct RpcCall<'a, T: ?Sized> {
    pub exchange: String,
    pub routing_key: String,
    pub payload: &'a T,
    /// Publish and return `None` without waiting for a reply.
    pub ignore_return: bool,
    /// Receive the reply on a private, auto-deleted queue.
    pub exclusive_return_channel: bool,
    /// Declare the shared reply queue before publishing.
    pub assert_return_queue: bool,
    /// Overrides `Settings::rpc_timeout` for this call.
    pub timeout: Option<Duration>,
}

impl<'a, T: ?Sized> RpcCall<'a, T> {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: &'a T) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            ignore_return: false,
            exclusive_return_channel: false,
            assert_return_queue: false,
            timeout: None,
        }
    }

    pub fn ignore_return(mut self, ignore: bool) -> Self {
        self.ignore_return = ignore;
        self
    }

    pub fn exclusive_return_channel(mut self, exclusive: bool) -> Self {
        self.exclusive_return_channel = exclusive;
        self
    }

    pub fn assert_return_queue(mut self, assert: bool) -> Self {
        self.assert_return_queue = assert;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Sends requests and matches their replies.
pub struct RpcCaller {
    vault: Arc<ChannelVault>,
    topology: Arc<TopologyAsserter>,
    codec: Arc<dyn PayloadCodec>,
    settings: Arc<Settings>,
}

impl RpcCaller {
    pub fn new(
        vault: Arc<ChannelVault>,
        topology: Arc<TopologyAsserter>,
        codec: Arc<dyn PayloadCodec>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            vault,
            topology,
            codec,
            settings,
        }
    }

    /// Publishes `payload` without any reply handling.
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = codec::encode(self.codec.as_ref(), payload)?;
        let routing_key = self.settings.routing_key(routing_key);
        let channel = self.vault.get_channel(exchange).await?;

        channel
            .publish(exchange, &routing_key, body, message_properties(self.codec.as_ref()))
            .await?;
        debug!(exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    /// Sends `call.payload` and resolves with the decoded reply.
    ///
    /// Returns `Ok(None)` when the call ignores its reply or the listener
    /// answered with JSON `null`.
    pub async fn remote_procedure_call<Req, Res>(&self, call: RpcCall<'_, Req>) -> Result<Option<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let body = codec::encode(self.codec.as_ref(), call.payload)?;
        let exclusive = call.exclusive_return_channel && !call.ignore_return;
        let reply_queue = if exclusive {
            exclusive_reply_queue(&call.exchange)
        } else {
            shared_reply_queue(&call.exchange)
        };

        if exclusive {
            let asserted = self
                .topology
                .assert_queue(&QueueSpec::exclusive_reply(&reply_queue))
                .await;
            if let Err(e) = asserted {
                self.vault.release(&reply_queue).await;
                return Err(e);
            }
        } else if call.assert_return_queue {
            self.topology
                .assert_queue(&QueueSpec::durable(&reply_queue))
                .await?;
        }

        let correlation_id = CorrelationId::generate();
        let mut properties = message_properties(self.codec.as_ref());
        properties.correlation_id = Some(correlation_id.to_string());
        properties.reply_to = Some(reply_queue.clone());

        if call.ignore_return {
            self.send(&call, body, properties).await?;
            return Ok(None);
        }

        let reply = self
            .exchange_for_reply(&call, &reply_queue, correlation_id, body, properties)
            .await;
        if exclusive {
            self.vault.release(&reply_queue).await;
        }

        codec::decode(self.codec.as_ref(), &reply?)
    }

    async fn exchange_for_reply<Req: ?Sized>(
        &self,
        call: &RpcCall<'_, Req>,
        reply_queue: &str,
        correlation_id: CorrelationId,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let on_response: ResponseCallback = Box::new(move |delivery| {
            tx.send(delivery.data)
                .map_err(|_| RabbitMQError::ResponseChannelClosed)
        });

        // registered first so a fast reply can't slip past us
        self.vault
            .register_pending_call(reply_queue, correlation_id.clone(), on_response)
            .await?;

        if let Err(e) = self.send(call, body, properties).await {
            self.vault.cancel_pending_call(reply_queue, &correlation_id);
            return Err(e);
        }

        let timeout = call.timeout.or_else(|| self.settings.rpc_timeout());
        let received = match timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, rx).await;
                if waited.is_err() {
                    self.vault.cancel_pending_call(reply_queue, &correlation_id);
                    warn!(
                        exchange = %call.exchange,
                        reply_queue,
                        correlation_id = %correlation_id,
                        "No reply within {:?}",
                        limit
                    );
                }
                waited?
            }
            None => rx.await,
        };

        received.map_err(|_| RabbitMQError::ResponseChannelClosed)
    }

    async fn send<Req: ?Sized>(
        &self,
        call: &RpcCall<'_, Req>,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let routing_key = self.settings.routing_key(&call.routing_key);
        let channel = self.vault.get_channel(&call.exchange).await?;

        channel
            .publish(&call.exchange, &routing_key, body, properties)
            .await?;
        info!(
            exchange = %call.exchange,
            routing_key = %routing_key,
            ignore_return = call.ignore_return,
            "Sent RPC request"
        );
        Ok(())
    }
}
