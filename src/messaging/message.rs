//! Broker message value type

use crate::messaging::error::MessagingResult;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// A message as seen by publishers and handlers, independent of the broker.
///
/// `key` drives partition/ordering affinity on Kafka and travels as a header
/// on NATS. `value` is opaque bytes, JSON by convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Topic (Kafka) or subject (NATS)
    pub topic: String,

    /// Partitioning / ordering key
    pub key: String,

    /// Raw payload
    pub value: Vec<u8>,

    /// Headers; ordering is not significant
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Broker timestamp on receive, creation time on publish
    pub timestamp: DateTime<Utc>,
}

impl BrokerMessage {
    /// Create a message stamped with the current time
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach headers
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Decode the JSON payload
    pub fn json<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    /// Look up a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.value.len()
    }
}
