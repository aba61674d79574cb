//! Kafka transport built on rdkafka

use crate::messaging::client::BrokerClient;
use crate::messaging::config::{BrokerKind, KafkaConfig};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message::BrokerMessage;
use crate::messaging::traits::{MessageReader, MessageWriter, ReadError, ReaderFactory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message;
use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::info;

/// How long close waits for in-flight deliveries
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a Kafka-backed [`BrokerClient`]
pub fn connect(config: &KafkaConfig) -> MessagingResult<BrokerClient> {
    let writer = KafkaWriter::new(config)?;

    info!(
        brokers = %config.bootstrap_servers(),
        client_id = %config.client_id,
        group_id = %config.group_id,
        "Kafka client initialized"
    );

    Ok(BrokerClient::new(
        BrokerKind::Kafka,
        config.topics.events.clone(),
        Arc::new(writer),
        Arc::new(KafkaReaderFactory::new(config.clone())),
    )
    .with_idle_backoff(config.consumer.idle_backoff())
    .with_health_check_timeout(config.consumer.health_check_timeout()))
}

/// Settings shared by producer and consumers
fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id);

    if let Some(sasl) = &config.sasl {
        client_config
            .set("security.protocol", &sasl.security_protocol)
            .set("sasl.mechanism", &sasl.mechanism)
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    client_config
}

/// Producer configuration derived from [`KafkaConfig`]
pub fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let producer = &config.producer;
    let mut client_config = base_client_config(config);
    client_config
        .set("acks", producer.required_acks.as_kafka_value())
        .set(
            "message.send.max.retries",
            producer.max_attempts.saturating_sub(1).to_string(),
        )
        .set("message.timeout.ms", producer.send_timeout_ms.to_string())
        .set("compression.type", &producer.compression_type);
    client_config
}

/// Consumer configuration for one topic reader
pub fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let consumer = &config.consumer;
    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "true")
        // Offsets are stored on ack, after the handler returns
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", consumer.offset_reset.as_str())
        .set("fetch.max.bytes", consumer.max_bytes.to_string())
        .set(
            "fetch.wait.max.ms",
            consumer.max_wait().as_millis().to_string(),
        );
    client_config
}

/// Map an rdkafka error onto the read outcome taxonomy.
///
/// Error codes are checked first; the message text is only a fallback for
/// errors that carry no code.
pub fn classify_kafka_error(err: &KafkaError) -> ReadError {
    if let KafkaError::PartitionEOF(_) = err {
        return ReadError::Timeout;
    }

    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::OperationTimedOut)
        | Some(RDKafkaErrorCode::RequestTimedOut)
        | Some(RDKafkaErrorCode::PartitionEOF) => ReadError::Timeout,
        _ if is_timeout_message(&err.to_string()) => ReadError::Timeout,
        _ => ReadError::Transport(err.to_string()),
    }
}

/// Known textual timeout signatures
pub fn is_timeout_message(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("timed out") || text.contains("no messages received")
}

fn decode(message: &BorrowedMessage<'_>) -> BrokerMessage {
    let headers: HashMap<String, String> = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        String::from_utf8_lossy(header.value.unwrap_or_default()).into_owned(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned())
        .unwrap_or_default();

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    BrokerMessage::new(message.topic(), key, message.payload().unwrap_or_default().to_vec())
        .with_headers(headers)
        .with_timestamp(timestamp)
}

/// Kafka writer
pub struct KafkaWriter {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaWriter {
    pub fn new(config: &KafkaConfig) -> MessagingResult<Self> {
        let producer: FutureProducer = producer_config(config).create().map_err(|e| {
            MessagingError::ConnectionFailed(format!("Kafka producer creation failed: {}", e))
        })?;

        Ok(Self {
            producer,
            send_timeout: config.producer.send_timeout(),
        })
    }
}

#[async_trait]
impl MessageWriter for KafkaWriter {
    async fn write(&self, message: &BrokerMessage) -> MessagingResult<()> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });

        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&message.topic)
            .key(message.key.as_str())
            .payload(message.value.as_slice())
            .headers(headers)
            .timestamp(message.timestamp.timestamp_millis());

        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| MessagingError::PublishFailed(format!("Kafka publish failed: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
            .await
            .map_err(|e| MessagingError::CloseFailed(e.to_string()))?
            .map_err(|e| MessagingError::CloseFailed(format!("Kafka flush failed: {}", e)))
    }
}

/// Creates one group consumer per topic
pub struct KafkaReaderFactory {
    config: KafkaConfig,
}

impl KafkaReaderFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReaderFactory for KafkaReaderFactory {
    async fn create_reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
        let consumer: StreamConsumer = consumer_config(&self.config).create().map_err(|e| {
            MessagingError::ConnectionFailed(format!("Kafka consumer creation failed: {}", e))
        })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::SubscribeFailed(format!("Kafka subscribe failed: {}", e)))?;

        info!(topic = %topic, group_id = %self.config.group_id, "Kafka reader subscribed");

        Ok(Arc::new(KafkaReader {
            topic: topic.to_string(),
            consumer: Arc::new(consumer),
            max_wait: self.config.consumer.max_wait(),
            pending: Mutex::new(None),
        }))
    }
}

/// Group consumer attached to a single topic
pub struct KafkaReader {
    topic: String,
    consumer: Arc<StreamConsumer>,
    max_wait: Duration,
    /// Partition and offset of the last message handed out
    pending: Mutex<Option<(i32, i64)>>,
}

#[async_trait]
impl MessageReader for KafkaReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&self) -> Result<BrokerMessage, ReadError> {
        match tokio::time::timeout(self.max_wait, self.consumer.recv()).await {
            Err(_elapsed) => Err(ReadError::Timeout),
            Ok(Err(e)) => Err(classify_kafka_error(&e)),
            Ok(Ok(message)) => {
                *self.pending.lock() = Some((message.partition(), message.offset()));
                Ok(decode(&message))
            }
        }
    }

    async fn ack(&self) -> MessagingResult<()> {
        let Some((partition, offset)) = self.pending.lock().take() else {
            return Ok(());
        };

        // The stored offset is the next one to consume
        self.consumer
            .store_offset(&self.topic, partition, offset + 1)
            .map_err(|e| {
                MessagingError::ConnectionFailed(format!(
                    "Kafka offset store failed on {}/{}: {}",
                    self.topic, partition, e
                ))
            })
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ReadError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        let result = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(topic.as_str()), timeout).map(|_| ())
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(classify_kafka_error(&e)),
            Err(e) => Err(ReadError::Transport(e.to_string())),
        }
    }

    async fn close(&self) -> MessagingResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
