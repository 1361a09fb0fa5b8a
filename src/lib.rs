// src/lib.rs
//! Request/reply RPC over a RabbitMQ-style broker.
//!
//! Start with [`RabbitMQClient`]: `remote_procedure_call` on the calling side,
//! `listen_procedure_call` on the serving side.

pub mod config;
pub mod env;
pub mod logging;
pub mod rabbitmq;
pub mod rabbitmq_client;

pub use config::Settings;
pub use rabbitmq::{
    ListenCall, ListenOptions, ListenerHandle, ListenerState, RabbitMQError, Result, RpcCall,
    StopOptions,
};
pub use rabbitmq_client::RabbitMQClient;
