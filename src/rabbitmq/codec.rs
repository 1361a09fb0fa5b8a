// src/rabbitmq/codec.rs
//! Payload encoding.
//!
//! Bodies are JSON. The codec works on `serde_json::Value` so it stays object
//! safe; `encode`/`decode` add the typed serde boundary on top.

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin1", alias = "iso-8859-1", alias = "binary")]
    Latin1,
}

impl Charset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Latin1 => "latin1",
        }
    }

    fn encode(&self, text: String) -> Result<Vec<u8>> {
        match self {
            Charset::Utf8 => Ok(text.into_bytes()),
            Charset::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        RabbitMQError::EncodingError(format!(
                            "character {:?} is not representable in latin1",
                            c
                        ))
                    })
                })
                .collect(),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| RabbitMQError::DeserializationError(e.to_string())),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Charset {
    type Err = RabbitMQError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "latin1" | "iso-8859-1" | "binary" => Ok(Charset::Latin1),
            other => Err(RabbitMQError::ConfigError(format!(
                "unsupported charset '{}'",
                other
            ))),
        }
    }
}

/// Turns payload values into message bodies and back.
pub trait PayloadCodec: Send + Sync {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode_value(&self, body: &[u8]) -> Result<Value>;

    fn content_type(&self) -> &str;

    fn content_encoding(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    charset: Charset,
}

impl JsonCodec {
    pub fn new(charset: Charset) -> Self {
        Self { charset }
    }
}

impl PayloadCodec for JsonCodec {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        self.charset.encode(serde_json::to_string(value)?)
    }

    fn decode_value(&self, body: &[u8]) -> Result<Value> {
        let text = self.charset.decode(body)?;
        serde_json::from_str(&text).map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn content_encoding(&self) -> &str {
        self.charset.as_str()
    }
}

pub fn encode<T: Serialize + ?Sized>(codec: &dyn PayloadCodec, payload: &T) -> Result<Vec<u8>> {
    codec.encode_value(&serde_json::to_value(payload)?)
}

pub fn decode<T: DeserializeOwned>(codec: &dyn PayloadCodec, body: &[u8]) -> Result<T> {
    serde_json::from_value(codec.decode_value(body)?)
        .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
}
