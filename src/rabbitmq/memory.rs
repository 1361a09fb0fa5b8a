// src/rabbitmq/memory.rs
//! In-process broker.
//!
//! `MemoryBroker` emulates the slice of AMQP 0-9-1 the RPC layer relies on:
//!
//! - direct, fanout, topic (`*` / `#`) and headers exchanges, plus the
//!   default exchange (`""`) which routes straight to the queue named by the
//!   routing key
//! - durable / auto-delete queues; redeclaring with different options fails
//! - pull-based consumers: a message leaves its queue only when a consumer
//!   asks for the next delivery, which models a prefetch of one
//! - ack, nack and requeue with the `redelivered` flag
//! - connection and channel closure, including broker-initiated closure
//!
//! Persistence, unacked-message recovery on channel close and header
//! matching arguments are not modelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, ChannelPtr, ConnectionPtr, Delivery,
    DeliveryStream, ExchangeInfo, ExchangeOptions, ExchangeType, MessageProperties, QueueInfo,
    QueueOptions,
};
use super::errors::{RabbitMQError, Result};

/// Counters exposed for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_attempts: usize,
    pub connections_opened: usize,
    pub channels_opened: usize,
    pub published: usize,
    pub acked: usize,
    pub nacked: usize,
    pub requeued: usize,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicUsize,
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    published: AtomicUsize,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    requeued: AtomicUsize,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, Arc<MemoryQueue>>,
}

struct MemoryExchange {
    kind: ExchangeType,
    options: ExchangeOptions,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Inner {
    topology: Mutex<Topology>,
    counters: Counters,
    failing_connects: AtomicUsize,
    failing_declares: AtomicUsize,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_tag: AtomicUsize,
}

/// A broker living entirely inside the process.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` queue declarations fail.
    pub fn fail_next_declares(&self, count: usize) {
        self.inner.failing_declares.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            connect_attempts: c.connect_attempts.load(Ordering::SeqCst),
            connections_opened: c.connections_opened.load(Ordering::SeqCst),
            channels_opened: c.channels_opened.load(Ordering::SeqCst),
            published: c.published.load(Ordering::SeqCst),
            acked: c.acked.load(Ordering::SeqCst),
            nacked: c.nacked.load(Ordering::SeqCst),
            requeued: c.requeued.load(Ordering::SeqCst),
        }
    }

    /// Number of ready messages waiting in `queue`, `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.inner
            .topology()
            .queues
            .get(queue)
            .map(|q| q.messages().len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.topology().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.topology().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.topology().exchanges.contains_key(exchange)
    }

    /// `(queue, routing_key)` pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .topology()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Closes every open connection as if the broker went away.
    pub async fn drop_connections(&self) {
        let connections: Vec<_> = {
            let mut guard = lock(&self.inner.connections);
            guard.retain(|c| c.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for connection in connections {
            connection.shutdown();
        }
    }
}

impl Inner {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        lock(&self.topology)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        let topology = self.topology();
        if exchange.is_empty() {
            return Ok(topology.queues.get(routing_key).cloned().into_iter().collect());
        }

        let target = topology.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut queues: Vec<Arc<MemoryQueue>> = Vec::new();
        for (queue, binding_key) in &target.bindings {
            let matched = match target.kind {
                ExchangeType::Direct => binding_key == routing_key,
                ExchangeType::Topic => topic_matches(binding_key, routing_key),
                ExchangeType::Fanout | ExchangeType::Headers => true,
            };
            if !matched || queues.iter().any(|q| &q.name == queue) {
                continue;
            }
            if let Some(q) = topology.queues.get(queue) {
                queues.push(q.clone());
            }
        }
        Ok(queues)
    }

    fn remove_if_unused(&self, queue: &Arc<MemoryQueue>) {
        if !queue.options.auto_delete || queue.consumers.load(Ordering::SeqCst) > 0 {
            return;
        }
        let mut topology = self.topology();
        if topology
            .queues
            .get(&queue.name)
            .is_some_and(|current| Arc::ptr_eq(current, queue))
        {
            topology.queues.remove(&queue.name);
            for exchange in topology.exchanges.values_mut() {
                exchange.bindings.retain(|(q, _)| q != &queue.name);
            }
            debug!(queue = %queue.name, "Auto-deleted queue");
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<ConnectionPtr> {
        let counters = &self.inner.counters;
        counters.connect_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let refused = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        counters.connections_opened.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            open: Arc::new(AtomicBool::new(true)),
            channels: Mutex::new(Vec::new()),
        });
        lock(&self.inner.connections).push(Arc::downgrade(&connection));
        Ok(connection)
    }
}

struct MemoryConnection {
    broker: Arc<Inner>,
    open: Arc<AtomicBool>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels {
            channel.shutdown();
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<ChannelPtr> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        tokio::task::yield_now().await;

        self.broker
            .counters
            .channels_opened
            .fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
            consumers: Mutex::new(HashMap::new()),
        });
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    broker: Arc<Inner>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    consumers: Mutex<HashMap<String, Arc<ConsumerState>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let consumers: Vec<_> = lock(&self.consumers).drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.cancel();
            self.broker.remove_if_unused(&consumer.queue);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeOptions,
    ) -> Result<ExchangeInfo> {
        self.ensure_open()?;
        let mut topology = self.broker.topology();
        match topology.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.options != options => {
                return Err(RabbitMQError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    name
                )));
            }
            Some(_) => {}
            None => {
                topology.exchanges.insert(
                    name.to_string(),
                    MemoryExchange {
                        kind,
                        options,
                        bindings: Vec::new(),
                    },
                );
            }
        }
        Ok(ExchangeInfo {
            name: name.to_string(),
        })
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        self.ensure_open()?;
        let refused = self
            .broker
            .failing_declares
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RabbitMQError::TopologyError(format!(
                "ACCESS_REFUSED - cannot declare queue '{}'",
                name
            )));
        }
        let mut topology = self.broker.topology();
        let queue = topology
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name, options)));
        if queue.options != options {
            return Err(RabbitMQError::TopologyError(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                name
            )));
        }
        Ok(queue.info())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology();
        if !topology.queues.contains_key(queue) {
            return Err(RabbitMQError::TopologyError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        let target = topology.exchanges.get_mut(exchange).ok_or_else(|| {
            RabbitMQError::TopologyError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        let queues = self.broker.route(exchange, routing_key)?;
        self.broker
            .counters
            .published
            .fetch_add(1, Ordering::SeqCst);
        trace!(exchange, routing_key, queues = queues.len(), "Routed message");

        for queue in queues {
            queue.push_back(StoredMessage {
                data: payload.clone(),
                properties: properties.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let target = self
            .broker
            .topology()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| {
                RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;

        let tag = if consumer_tag.is_empty() {
            format!(
                "amq.ctag-{}",
                self.broker.next_tag.fetch_add(1, Ordering::SeqCst)
            )
        } else {
            consumer_tag.to_string()
        };

        let consumer = Arc::new(ConsumerState {
            queue: target,
            broker: self.broker.clone(),
            cancelled: AtomicBool::new(false),
        });
        {
            let mut consumers = lock(&self.consumers);
            if consumers.contains_key(&tag) {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    tag
                )));
            }
            consumers.insert(tag, consumer.clone());
        }
        consumer.queue.consumers.fetch_add(1, Ordering::SeqCst);

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok(delivery), consumer))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let consumer = lock(&self.consumers).remove(consumer_tag);
        if let Some(consumer) = consumer {
            consumer.cancel();
            self.broker.remove_if_unused(&consumer.queue);
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct StoredMessage {
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct MemoryQueue {
    name: String,
    options: QueueOptions,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    consumers: AtomicUsize,
}

impl MemoryQueue {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers: AtomicUsize::new(0),
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<StoredMessage>> {
        lock(&self.messages)
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.name.clone(),
            message_count: u32::try_from(self.messages().len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.load(Ordering::SeqCst))
                .unwrap_or(u32::MAX),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        self.messages().push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, mut message: StoredMessage) {
        message.redelivered = true;
        self.messages().push_front(message);
        self.notify.notify_one();
    }
}

struct ConsumerState {
    queue: Arc<MemoryQueue>,
    broker: Arc<Inner>,
    cancelled: AtomicBool,
}

impl ConsumerState {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
            self.queue.notify.notify_waiters();
        }
    }

    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancelled.load(Ordering::SeqCst) {
                // hand a possibly consumed wakeup on to a live consumer
                self.queue.notify.notify_one();
                return None;
            }
            let next = self.queue.messages().pop_front();
            if let Some(message) = next {
                return Some(Delivery::new(
                    message.data.clone(),
                    message.properties.clone(),
                    message.redelivered,
                    None,
                    Box::new(MemoryAcker {
                        queue: self.queue.clone(),
                        broker: self.broker.clone(),
                        message,
                        settled: AtomicBool::new(false),
                    }),
                ));
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    broker: Arc<Inner>,
    message: StoredMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            Err(RabbitMQError::AckError(
                "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.broker.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.broker.counters.nacked.fetch_add(1, Ordering::SeqCst);
        if requeue {
            self.broker.counters.requeued.fetch_add(1, Ordering::SeqCst);
            self.queue.requeue(self.message.clone());
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((k, key_rest))) => word == k && matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
