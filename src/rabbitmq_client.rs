// src/rabbitmq_client.rs
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::Settings;
use crate::rabbitmq::{
    BrokerPtr, ChannelPtr, ChannelVault, ConnectionManager, ConnectionPtr, ConnectionState,
    ExchangeInfo, ExchangeSpec, JsonCodec, LapinBroker, ListenCall, ListenOptions, ListenerHandle,
    PayloadCodec, QueueInfo, QueueSpec, RedeliveryPolicy, Result, RpcCall, RpcCaller, RpcListener,
    TopologyAsserter,
};

/// Entry point: owns the connection, the channel vault and everything built
/// on them. Clones share all state.
#[derive(Clone)]
pub struct RabbitMQClient {
    settings: Arc<Settings>,
    connections: Arc<ConnectionManager>,
    vault: Arc<ChannelVault>,
    topology: Arc<TopologyAsserter>,
    caller: Arc<RpcCaller>,
    listener: Arc<RpcListener>,
}

impl RabbitMQClient {
    /// Client talking to a real broker through lapin.
    pub fn new(settings: Settings) -> Self {
        Self::with_broker(settings, Arc::new(LapinBroker::new()))
    }

    /// Settings from `RABBITMQ_*` environment variables and `.env`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Settings::from_env()?))
    }

    pub fn with_broker(settings: Settings, broker: BrokerPtr) -> Self {
        let codec = Arc::new(JsonCodec::new(settings.encoding_charset));
        Self::with_codec(settings, broker, codec)
    }

    pub fn with_codec(settings: Settings, broker: BrokerPtr, codec: Arc<dyn PayloadCodec>) -> Self {
        let settings = Arc::new(settings);
        let connections = Arc::new(ConnectionManager::new(broker, &settings));
        let vault = Arc::new(ChannelVault::new(
            connections.clone(),
            RedeliveryPolicy::new(settings.max_redeliveries),
        ));
        let topology = Arc::new(TopologyAsserter::new(vault.clone()));
        let caller = Arc::new(RpcCaller::new(
            vault.clone(),
            topology.clone(),
            codec.clone(),
            settings.clone(),
        ));
        let listener = Arc::new(RpcListener::new(
            vault.clone(),
            topology.clone(),
            codec,
            settings.clone(),
        ));

        Self {
            settings,
            connections,
            vault,
            topology,
            caller,
            listener,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn get_connection(&self) -> ConnectionPtr {
        self.connections.get_connection().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connections.disconnect().await
    }

    pub async fn get_channel(&self, name: &str) -> Result<ChannelPtr> {
        self.vault.get_channel(name).await
    }

    pub fn vault(&self) -> &ChannelVault {
        &self.vault
    }

    pub async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<ExchangeInfo> {
        self.topology.assert_exchange(spec).await
    }

    pub async fn assert_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        self.topology.assert_queue(spec).await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.topology.bind_queue(queue, exchange, routing_key).await
    }

    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.caller.publish(exchange, routing_key, payload).await
    }

    pub async fn remote_procedure_call<Req, Res>(&self, call: RpcCall<'_, Req>) -> Result<Option<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.caller.remote_procedure_call(call).await
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
        self.listener.listen_procedure_call(options, callback).await
    }
}
