// src/rabbitmq/channel_manager.rs
//! Named channels and reply dispatch.
//!
//! Every logical name maps to one broker channel. Reply queues additionally
//! get a single dispatch loop that consumes the queue of the same name and
//! hands each message to the pending call whose correlation id it carries.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{ChannelPtr, Delivery, DeliveryStream};
use super::connection::ConnectionManager;
use super::correlation::{CorrelationId, PendingCalls, ResponseCallback};
use super::errors::{RabbitMQError, Result};

/// What to do with a reply nobody is waiting for.
///
/// Requeueing lets another consumer of a shared reply queue pick it up, but
/// must be bounded or the message bounces forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
}

impl RedeliveryPolicy {
    pub fn new(max_redeliveries: u32) -> Self {
        Self { max_redeliveries }
    }

    pub fn should_requeue(&self, delivery: &Delivery) -> bool {
        match delivery.delivery_count {
            Some(count) => count < self.max_redeliveries,
            // classic queues only say whether it was delivered before
            None => self.max_redeliveries > 0 && !delivery.redelivered,
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

pub struct ChannelVault {
    connections: Arc<ConnectionManager>,
    policy: RedeliveryPolicy,
    entries: Mutex<HashMap<String, Arc<ChannelEntry>>>,
    next_consumer: AtomicU64,
}

struct ChannelEntry {
    name: String,
    channel: tokio::sync::Mutex<Option<ChannelPtr>>,
    pending: Mutex<PendingCalls>,
    // id of the attached dispatch loop, if any
    consumer: Mutex<Option<u64>>,
}

impl ChannelVault {
    pub fn new(connections: Arc<ConnectionManager>, policy: RedeliveryPolicy) -> Self {
        Self {
            connections,
            policy,
            entries: Mutex::new(HashMap::new()),
            next_consumer: AtomicU64::new(1),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn entry(&self, name: &str) -> Arc<ChannelEntry> {
        lock(&self.entries)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ChannelEntry {
                    name: name.to_string(),
                    channel: tokio::sync::Mutex::new(None),
                    pending: Mutex::new(PendingCalls::new()),
                    consumer: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Returns the channel for `name`, opening it on first use.
    ///
    /// Concurrent first callers wait for the one that opens it. A channel the
    /// broker has since closed is replaced, which also detaches its
    /// dispatch loop.
    pub async fn get_channel(&self, name: &str) -> Result<ChannelPtr> {
        let entry = self.entry(name);
        let mut slot = entry.channel.lock().await;

        if let Some(channel) = slot.as_ref() {
            if channel.is_connected() {
                return Ok(channel.clone());
            }
            warn!(channel = name, "Channel was closed, reopening");
            *lock(&entry.consumer) = None;
        }

        let connection = self.connections.get_connection().await;
        let channel = connection.create_channel().await?;
        debug!(channel = name, "Created channel");

        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Registers interest in the reply carrying `correlation_id` on the
    /// reply queue `name`, attaching the dispatch loop if none runs yet.
    pub async fn register_pending_call(
        &self,
        name: &str,
        correlation_id: CorrelationId,
        on_response: ResponseCallback,
    ) -> Result<()> {
        let channel = self.get_channel(name).await?;
        let entry = self.entry(name);

        if !lock(&entry.pending).register(correlation_id.clone(), on_response) {
            return Err(RabbitMQError::Unknown(format!(
                "correlation id {} is already pending on {}",
                correlation_id, name
            )));
        }

        let consumer_id = {
            let mut consumer = lock(&entry.consumer);
            if consumer.is_some() {
                return Ok(());
            }
            let id = self.next_consumer.fetch_add(1, Ordering::SeqCst);
            *consumer = Some(id);
            id
        };

        let tag = format!("{}-{}", name, &Uuid::new_v4().to_string()[..8]);
        match channel.consume(name, &tag).await {
            Ok(stream) => {
                info!(channel = name, consumer_tag = %tag, "Attached reply dispatcher");
                tokio::spawn(dispatch_loop(entry, consumer_id, stream, self.policy));
                Ok(())
            }
            Err(e) => {
                entry.release_consumer(consumer_id);
                lock(&entry.pending).remove(&correlation_id);
                Err(e)
            }
        }
    }

    /// Forgets a pending call, e.g. after its caller gave up waiting.
    pub fn cancel_pending_call(&self, name: &str, correlation_id: &CorrelationId) -> bool {
        let Some(entry) = lock(&self.entries).get(name).cloned() else {
            return false;
        };
        let removed = lock(&entry.pending).remove(correlation_id);
        removed
    }

    pub fn pending_calls(&self, name: &str) -> usize {
        lock(&self.entries)
            .get(name)
            .map(|entry| lock(&entry.pending).len())
            .unwrap_or(0)
    }

    /// Names of the channels currently held.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_consuming(&self, name: &str) -> bool {
        lock(&self.entries)
            .get(name)
            .is_some_and(|entry| lock(&entry.consumer).is_some())
    }

    /// Evicts `name` and closes its channel. Calls still pending on it are
    /// dropped, so their callers see the response channel close.
    pub async fn release(&self, name: &str) {
        let Some(entry) = lock(&self.entries).remove(name) else {
            return;
        };
        let channel = entry.channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(channel = name, error = %e, "Failed to close released channel");
            }
        }
        debug!(channel = name, "Released channel");
    }
}

impl ChannelEntry {
    fn release_consumer(&self, consumer_id: u64) {
        let mut consumer = lock(&self.consumer);
        if *consumer == Some(consumer_id) {
            *consumer = None;
        }
    }

    async fn dispatch(&self, delivery: Delivery, policy: RedeliveryPolicy) {
        let callback = delivery
            .correlation_id()
            .map(CorrelationId::from)
            .and_then(|id| lock(&self.pending).take(&id));

        let Some(callback) = callback else {
            let requeue = policy.should_requeue(&delivery);
            warn!(
                channel = %self.name,
                correlation_id = ?delivery.correlation_id(),
                requeue,
                "No pending call for reply"
            );
            if let Err(e) = delivery.nack(requeue).await {
                error!(channel = %self.name, "Failed to negatively acknowledge reply: {}", e);
            }
            return;
        };

        if let Err(e) = delivery.ack().await {
            error!(channel = %self.name, "Failed to acknowledge reply: {}", e);
        }

        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(delivery))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(channel = %self.name, "Reply callback failed: {}", e),
            Err(_) => error!(channel = %self.name, "Reply callback panicked"),
        }
    }
}

async fn dispatch_loop(
    entry: Arc<ChannelEntry>,
    consumer_id: u64,
    mut stream: DeliveryStream,
    policy: RedeliveryPolicy,
) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => entry.dispatch(delivery, policy).await,
            Err(e) => {
                error!(channel = %entry.name, "Error receiving reply: {}", e);
                break;
            }
        }
    }

    entry.release_consumer(consumer_id);
    debug!(channel = %entry.name, "Reply dispatcher stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::rabbitmq::broker::{MessageProperties, QueueOptions};
    use crate::rabbitmq::memory::MemoryBroker;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn vault(broker: &MemoryBroker) -> Arc<ChannelVault> {
        let settings = Settings {
            retries_interval_ms: 10,
            ..Settings::default()
        };
        let connections = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), &settings));
        Arc::new(ChannelVault::new(connections, RedeliveryPolicy::default()))
    }

    async fn reply_queue(vault: &ChannelVault, name: &str) -> ChannelPtr {
        let channel = vault.get_channel(name).await.unwrap();
        channel
            .declare_queue(name, QueueOptions::default())
            .await
            .unwrap();
        channel
    }

    async fn send_reply(channel: &ChannelPtr, queue: &str, correlation_id: &str, body: &str) {
        channel
            .publish(
                "",
                queue,
                body.as_bytes().to_vec(),
                MessageProperties {
                    correlation_id: Some(correlation_id.to_string()),
                    ..MessageProperties::default()
                },
            )
            .await
            .unwrap();
    }

    fn forward_to(tx: oneshot::Sender<Vec<u8>>) -> ResponseCallback {
        Box::new(move |delivery| {
            tx.send(delivery.data)
                .map_err(|_| RabbitMQError::ResponseChannelClosed)
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_opens_one_channel() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let vault = vault.clone();
                tokio::spawn(async move { vault.get_channel("orders").await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        vault.get_channel("payments").await.unwrap();
        assert_eq!(broker.stats().channels_opened, 2);
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn replies_reach_their_own_caller() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        let channel = reply_queue(&vault, "calc.return").await;

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        vault
            .register_pending_call("calc.return", "a".into(), forward_to(tx_a))
            .await
            .unwrap();
        vault
            .register_pending_call("calc.return", "b".into(), forward_to(tx_b))
            .await
            .unwrap();
        assert_eq!(vault.pending_calls("calc.return"), 2);
        assert!(vault.is_consuming("calc.return"));

        send_reply(&channel, "calc.return", "b", "for-b").await;
        send_reply(&channel, "calc.return", "a", "for-a").await;

        assert_eq!(rx_a.await.unwrap(), b"for-a");
        assert_eq!(rx_b.await.unwrap(), b"for-b");
        assert_eq!(vault.pending_calls("calc.return"), 0);
        assert_eq!(broker.stats().acked, 2);
    }

    #[tokio::test]
    async fn unmatched_reply_is_requeued_once_then_dropped() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        let channel = reply_queue(&vault, "calc.return").await;

        let (tx, rx) = oneshot::channel();
        vault
            .register_pending_call("calc.return", "known".into(), forward_to(tx))
            .await
            .unwrap();

        send_reply(&channel, "calc.return", "stranger", "lost").await;
        send_reply(&channel, "calc.return", "known", "found").await;

        assert_eq!(rx.await.unwrap(), b"found");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = broker.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.nacked, 2);
        assert_eq!(broker.queue_len("calc.return"), Some(0));
    }

    #[tokio::test]
    async fn duplicate_reply_is_handled_as_unmatched() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        let channel = reply_queue(&vault, "calc.return").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        vault
            .register_pending_call(
                "calc.return",
                "twice".into(),
                Box::new(move |delivery| {
                    tx.send(delivery.data)
                        .map_err(|_| RabbitMQError::ResponseChannelClosed)
                }),
            )
            .await
            .unwrap();

        send_reply(&channel, "calc.return", "twice", "first").await;
        send_reply(&channel, "calc.return", "twice", "second").await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.stats().nacked < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("duplicate reply was never rejected");

        assert_eq!(rx.recv().await.unwrap(), b"first");
        assert!(rx.try_recv().is_err());
        let stats = broker.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.nacked, 2);
        assert_eq!(vault.pending_calls("calc.return"), 0);
        assert_eq!(broker.queue_len("calc.return"), Some(0));
    }

    #[tokio::test]
    async fn failing_callbacks_do_not_stop_dispatch() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        let channel = reply_queue(&vault, "calc.return").await;

        vault
            .register_pending_call(
                "calc.return",
                "err".into(),
                Box::new(|_| Err(RabbitMQError::Unknown("handler exploded".into()))),
            )
            .await
            .unwrap();
        vault
            .register_pending_call("calc.return", "panic".into(), Box::new(|_| panic!("boom")))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        vault
            .register_pending_call(
                "calc.return",
                "ok".into(),
                Box::new(move |d| {
                    tx.send(d.data).ok();
                    Ok(())
                }),
            )
            .await
            .unwrap();

        send_reply(&channel, "calc.return", "err", "1").await;
        send_reply(&channel, "calc.return", "panic", "2").await;
        send_reply(&channel, "calc.return", "ok", "3").await;

        assert_eq!(rx.recv().await.unwrap(), b"3");
        assert!(vault.is_consuming("calc.return"));
        assert_eq!(vault.pending_calls("calc.return"), 0);
    }

    #[tokio::test]
    async fn cancelled_call_is_forgotten() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        reply_queue(&vault, "calc.return").await;

        let id = CorrelationId::generate();
        vault
            .register_pending_call("calc.return", id.clone(), Box::new(|_| Ok(())))
            .await
            .unwrap();
        assert!(vault
            .register_pending_call("calc.return", id.clone(), Box::new(|_| Ok(())))
            .await
            .is_err());

        assert!(vault.cancel_pending_call("calc.return", &id));
        assert!(!vault.cancel_pending_call("calc.return", &id));
        assert!(!vault.cancel_pending_call("unknown", &id));
    }

    #[tokio::test]
    async fn release_closes_and_evicts() {
        let broker = MemoryBroker::new();
        let vault = vault(&broker);
        let channel = vault.get_channel("calc.return.1").await.unwrap();

        vault.release("calc.return.1").await;
        assert!(!channel.is_connected());

        let reopened = vault.get_channel("calc.return.1").await.unwrap();
        assert!(reopened.is_connected());
        assert_eq!(broker.stats().channels_opened, 2);
    }

    #[test]
    fn redelivery_policy_bounds() {
        struct Noop;
        #[async_trait::async_trait]
        impl crate::rabbitmq::broker::Acknowledger for Noop {
            async fn ack(&self) -> Result<()> {
                Ok(())
            }
            async fn nack(&self, _requeue: bool) -> Result<()> {
                Ok(())
            }
        }
        let delivery = |redelivered, count| {
            Delivery::new(
                Vec::new(),
                MessageProperties::default(),
                redelivered,
                count,
                Box::new(Noop),
            )
        };

        let policy = RedeliveryPolicy::new(1);
        assert!(policy.should_requeue(&delivery(false, None)));
        assert!(!policy.should_requeue(&delivery(true, None)));

        let quorum = RedeliveryPolicy::new(3);
        assert!(quorum.should_requeue(&delivery(true, Some(2))));
        assert!(!quorum.should_requeue(&delivery(true, Some(3))));

        let never = RedeliveryPolicy::new(0);
        assert!(!never.should_requeue(&delivery(false, None)));
    }
}
