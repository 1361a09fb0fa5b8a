// src/rabbitmq/mod.rs
// RPC building blocks over a RabbitMQ-style broker

pub mod errors;
pub mod broker;           // Transport seam shared by lapin and the in-memory broker
pub mod connection;       // One lazily established, self-healing connection
pub mod channel_manager;  // Named channels and reply dispatch
pub mod correlation;
pub mod codec;
pub mod topology;
pub mod request_response;
pub mod listener;

// Broker implementations
pub mod amqp_client;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinBroker;
pub use broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerPtr, ChannelPtr, ConnectionPtr, Delivery,
    ExchangeInfo, ExchangeOptions, ExchangeType, MessageProperties, QueueInfo, QueueOptions,
};
pub use channel_manager::{ChannelVault, RedeliveryPolicy};
pub use codec::{Charset, JsonCodec, PayloadCodec};
pub use connection::{ConnectionManager, ConnectionState};
pub use correlation::CorrelationId;
pub use errors::{RabbitMQError, Result};
pub use listener::{
    ListenCall, ListenOptions, ListenerHandle, ListenerState, RpcListener, StopHandle, StopOptions,
};
pub use memory::{BrokerStats, MemoryBroker};
pub use request_response::{RpcCall, RpcCaller};
pub use topology::{ExchangeSpec, QueueSpec, TopologyAsserter};
