// src/rabbitmq/listener.rs
//! Serving side of the RPC pattern.
//!
//! `RpcListener::listen_procedure_call` asserts the request/reply topology,
//! starts one consume loop on a dedicated channel and returns a
//! [`ListenerHandle`] straight away. The loop decodes each request, runs the
//! handler, publishes the result to the request's `reply_to` queue and only
//! then acknowledges. Stopping is cooperative: the flag is checked before the
//! next message is pulled, so a stop requested from inside a handler lets the
//! current message finish and leaves everything else on the queue.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{ChannelPtr, Delivery, DeliveryStream, ExchangeType};
use super::channel_manager::ChannelVault;
use super::codec::{self, PayloadCodec};
use super::errors::{RabbitMQError, Result};
use super::request_response::{message_properties, shared_reply_queue};
use super::topology::{ExchangeSpec, QueueSpec, TopologyAsserter};
use crate::config::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    pub queue: String,
    /// Publish the handler's result to the request's `reply_to`.
    pub return_value: bool,
    /// Declare topic exchanges named after the request and reply queues.
    pub auto_exchange: bool,
}

impl ListenOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            return_value: true,
            auto_exchange: true,
        }
    }

    pub fn return_value(mut self, return_value: bool) -> Self {
        self.return_value = return_value;
        self
    }

    pub fn auto_exchange(mut self, auto_exchange: bool) -> Self {
        self.auto_exchange = auto_exchange;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Running,
    StopRequested,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Close the shared broker connection once the loop has exited.
    pub disconnect_after_stop: bool,
}

/// Requests a listener to stop. Cheap to clone; safe to call from inside
/// the handler.
#[derive(Debug, Clone)]
pub struct StopHandle {
    state: Arc<watch::Sender<ListenerState>>,
    disconnect_after_stop: Arc<AtomicBool>,
}

impl StopHandle {
    fn new() -> Self {
        let (state, _) = watch::channel(ListenerState::Running);
        Self {
            state: Arc::new(state),
            disconnect_after_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self, options: StopOptions) {
        if options.disconnect_after_stop {
            self.disconnect_after_stop.store(true, Ordering::SeqCst);
        }
        self.state.send_if_modified(|state| {
            if *state == ListenerState::Running {
                *state = ListenerState::StopRequested;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    fn is_requested(&self) -> bool {
        self.state() != ListenerState::Running
    }
}

/// What a handler receives for each request.
#[derive(Debug)]
pub struct ListenCall<T> {
    pub payload: T,
    pub correlation_id: Option<String>,
    pub stop: StopHandle,
}

pub struct ListenerHandle {
    queue: String,
    stop: StopHandle,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ListenerState {
        self.stop.state()
    }

    pub fn stop(&self, options: StopOptions) {
        self.stop.stop(options);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Waits for the consume loop to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| RabbitMQError::Unknown(format!("listener on {} failed: {}", self.queue, e)))
    }
}

pub struct RpcListener {
    vault: Arc<ChannelVault>,
    topology: Arc<TopologyAsserter>,
    codec: Arc<dyn PayloadCodec>,
    settings: Arc<Settings>,
}

impl RpcListener {
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

    pub async fn listen_procedure_call<Req, Res, F, Fut>(
        &self,
        options: ListenOptions,
        callback: F,
    ) -> Result<ListenerHandle>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(ListenCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
    {
        self.assert_topology(&options).await?;

        let channel_name = format!("{}.listener.{}", options.queue, short_id());
        let channel = self.vault.get_channel(&channel_name).await?;
        channel.set_prefetch(self.settings.prefetch_count).await?;

        let consumer_tag = format!("{}-{}", options.queue, short_id());
        let stream = channel.consume(&options.queue, &consumer_tag).await?;
        info!(
            queue = %options.queue,
            consumer_tag = %consumer_tag,
            prefetch = self.settings.prefetch_count,
            "Listening for RPC requests"
        );

        let stop = StopHandle::new();
        let worker = Worker {
            queue: options.queue.clone(),
            return_value: options.return_value,
            channel,
            channel_name,
            consumer_tag,
            vault: self.vault.clone(),
            codec: self.codec.clone(),
            stop: stop.clone(),
            callback,
        };
        let task = tokio::spawn(worker.run::<Req, Res, Fut>(stream));

        Ok(ListenerHandle {
            queue: options.queue,
            stop,
            task,
        })
    }

    async fn assert_topology(&self, options: &ListenOptions) -> Result<()> {
        let queue = options.queue.as_str();
        let reply_queue = shared_reply_queue(queue);

        self.topology.assert_queue(&QueueSpec::durable(queue)).await?;
        self.topology
            .assert_queue(&QueueSpec::durable(&reply_queue))
            .await?;

        if options.auto_exchange {
            let binding_key = self.settings.routing_key("*");
            for name in [queue, reply_queue.as_str()] {
                self.topology
                    .assert_exchange(&ExchangeSpec::new(name, ExchangeType::Topic).durable())
                    .await?;
                self.topology.bind_queue(name, name, &binding_key).await?;
            }
        }
        Ok(())
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

struct Worker<F> {
    queue: String,
    return_value: bool,
    channel: ChannelPtr,
    channel_name: String,
    consumer_tag: String,
    vault: Arc<ChannelVault>,
    codec: Arc<dyn PayloadCodec>,
    stop: StopHandle,
    callback: F,
}

impl<F> Worker<F> {
    async fn run<Req, Res, Fut>(self, mut stream: DeliveryStream)
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(ListenCall<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
    {
        let mut stop_requests = self.stop.state.subscribe();

        while !self.stop.is_requested() {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut stop_requests) => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle::<Req, Res, Fut>(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, "Error receiving request: {}", e);
                    break;
                }
                None => {
                    warn!(queue = %self.queue, "Request stream ended");
                    break;
                }
            }
        }

        drop(stream);
        self.shutdown().await;
    }

    async fn handle<Req, Res, Fut>(&self, delivery: Delivery)
    where
        Req: DeserializeOwned,
        Res: Serialize,
        F: Fn(ListenCall<Req>) -> Fut,
        Fut: Future<Output = anyhow::Result<Res>>,
    {
        let payload: Req = match codec::decode(self.codec.as_ref(), &delivery.data) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queue = %self.queue, "Dropping undecodable request: {}", e);
                self.reject(&delivery).await;
                return;
            }
        };

        let call = ListenCall {
            payload,
            correlation_id: delivery.correlation_id().map(str::to_string),
            stop: self.stop.clone(),
        };
        let outcome = AssertUnwindSafe(async { (self.callback)(call).await })
            .catch_unwind()
            .await;

        // encoded here so nothing borrowed from the result is held across an await
        let reply_to = if self.return_value { delivery.reply_to() } else { None };
        let encoded = match outcome {
            Ok(Ok(result)) => reply_to
                .map(|_| codec::encode(self.codec.as_ref(), &result))
                .transpose(),
            Ok(Err(e)) => {
                error!(queue = %self.queue, correlation_id = ?delivery.correlation_id(), "Handler failed: {:#}", e);
                self.reject(&delivery).await;
                return;
            }
            Err(_) => {
                error!(queue = %self.queue, correlation_id = ?delivery.correlation_id(), "Handler panicked");
                self.reject(&delivery).await;
                return;
            }
        };

        let body = match encoded {
            Ok(body) => body,
            Err(e) => {
                error!(queue = %self.queue, "Failed to encode reply: {}", e);
                self.reject(&delivery).await;
                return;
            }
        };

        if let (Some(reply_to), Some(body)) = (reply_to, body) {
            if let Err(e) = self.reply(reply_to, delivery.correlation_id(), body).await {
                error!(queue = %self.queue, reply_to, "Failed to publish reply: {}", e);
                self.reject(&delivery).await;
                return;
            }
        }

        if let Err(e) = delivery.ack().await {
            error!(queue = %self.queue, "Failed to acknowledge request: {}", e);
        }
    }

    async fn reply(&self, reply_to: &str, correlation_id: Option<&str>, body: Vec<u8>) -> Result<()> {
        let mut properties = message_properties(self.codec.as_ref());
        properties.correlation_id = correlation_id.map(str::to_string);

        // reply_to always names a queue, so the default exchange reaches it
        self.channel.publish("", reply_to, body, properties).await?;
        debug!(queue = %self.queue, reply_to, "Published reply");
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) {
        if let Err(e) = delivery.nack(false).await {
            error!(queue = %self.queue, "Failed to reject request: {}", e);
        }
    }

    async fn shutdown(&self) {
        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(queue = %self.queue, "Failed to cancel consumer: {}", e);
        }
        self.vault.release(&self.channel_name).await;

        if self.stop.disconnect_after_stop.load(Ordering::SeqCst) {
            if let Err(e) = self.vault.connections().disconnect().await {
                error!(queue = %self.queue, "Failed to disconnect after stop: {}", e);
            }
        }

        self.stop.state.send_replace(ListenerState::Stopped);
        info!(queue = %self.queue, "Listener stopped");
    }
}

async fn stop_requested(requests: &mut watch::Receiver<ListenerState>) {
    // the sender lives in the worker, so this only errs once it is gone
    let _ = requests
        .wait_for(|state| *state != ListenerState::Running)
        .await;
}
