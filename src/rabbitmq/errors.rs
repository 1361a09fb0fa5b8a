// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Payload encoding error: {0}")]
    EncodingError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("Response channel was closed before a reply arrived")]
    ResponseChannelClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, RabbitMQError>;

/// Sorts lapin failures by the layer that broke. Call sites that know more
/// (declares, publishes, acks) map errors themselves.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let message = error.to_string();
        match error {
            LapinError::IOError(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::MissingHeartbeatError => RabbitMQError::ConnectionError(message),
            LapinError::InvalidChannelState(_)
            | LapinError::InvalidChannel(_)
            | LapinError::ChannelsLimitReached
            | LapinError::ProtocolError(_) => RabbitMQError::ChannelError(message),
            _ => RabbitMQError::Unknown(message),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("no reply within the RPC timeout".to_string())
    }
}
