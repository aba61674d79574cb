//! Broker client: one writer, a pool of per-topic readers, and the subscribe loop

use crate::messaging::backoff::IdleBackoff;
use crate::messaging::config::BrokerKind;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message::BrokerMessage;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{MessageHandler, MessageReader, MessageWriter, ReadError, ReaderFactory};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default bound on a health probe
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Uniform publish/subscribe/health/close surface over one broker connection.
///
/// Readers are created lazily, at most once per topic, and live until
/// [`BrokerClient::close`].
pub struct BrokerClient {
    kind: BrokerKind,
    default_topic: String,
    writer: Arc<dyn MessageWriter>,
    reader_factory: Arc<dyn ReaderFactory>,
    readers: RwLock<HashMap<String, Arc<dyn MessageReader>>>,
    idle_backoff: IdleBackoff,
    health_check_timeout: Duration,
}

impl BrokerClient {
    /// Create a client from its transport parts.
    ///
    /// `default_topic` is the topic a health check attaches to when no reader exists yet.
    pub fn new(
        kind: BrokerKind,
        default_topic: impl Into<String>,
        writer: Arc<dyn MessageWriter>,
        reader_factory: Arc<dyn ReaderFactory>,
    ) -> Self {
        Self {
            kind,
            default_topic: default_topic.into(),
            writer,
            reader_factory,
            readers: RwLock::new(HashMap::new()),
            idle_backoff: IdleBackoff::default(),
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }

    /// Override the idle backoff policy
    pub fn with_idle_backoff(mut self, idle_backoff: IdleBackoff) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    /// Override the health probe bound
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn kind(&self) -> BrokerKind {
        self.kind
    }

    /// Number of readers created so far
    pub async fn reader_count(&self) -> usize {
        self.readers.read().await.len()
    }

    /// Topics with a live reader
    pub async fn reader_topics(&self) -> Vec<String> {
        self.readers.read().await.keys().cloned().collect()
    }

    /// Get the reader for `topic`, creating it on first use
    pub async fn reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
        if let Some(reader) = self.readers.read().await.get(topic) {
            return Ok(reader.clone());
        }

        let mut readers = self.readers.write().await;

        // Another task may have created it while we waited for the write lock
        if let Some(reader) = readers.get(topic) {
            return Ok(reader.clone());
        }

        let reader = self.reader_factory.create_reader(topic).await?;
        readers.insert(topic.to_string(), reader.clone());

        info!(broker = %self.kind, topic = %topic, "Created reader");
        Ok(reader)
    }

    /// Publish raw bytes.
    ///
    /// One transport write per call; transport failures are returned to the
    /// caller, which decides whether to retry.
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> MessagingResult<()> {
        if topic.is_empty() {
            return Err(MessagingError::ConfigurationError(
                "publish requires a non-empty topic".to_string(),
            ));
        }

        let message = BrokerMessage::new(topic, key, value).with_headers(headers);
        let broker = self.kind.as_str();

        match self.writer.write(&message).await {
            Ok(()) => {
                MESSAGING_METRICS
                    .messages_published
                    .with_label_values(&[topic, broker])
                    .inc();
                debug!(
                    broker = %self.kind,
                    topic = %topic,
                    key = %key,
                    size = message.size(),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                MESSAGING_METRICS
                    .publish_failures
                    .with_label_values(&[topic, broker])
                    .inc();
                warn!(broker = %self.kind, topic = %topic, key = %key, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
        headers: HashMap<String, String>,
    ) -> MessagingResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, key, payload, headers).await
    }

    /// Consume `topic` until `cancel` fires.
    ///
    /// Cancellation is checked before each read, so it takes effect within one
    /// read window. Timeouts drive the idle backoff, transport errors are
    /// logged and retried forever, handler errors are logged and the loop moves
    /// on to the next message. Each message is acknowledged after its handler
    /// returns. The only exit is `MessagingError::Cancelled`,
    /// or an error creating the reader.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagingResult<()> {
        let reader = self.reader(topic).await?;
        let broker = self.kind.as_str();
        let mut backoff = self.idle_backoff.clone();
        backoff.reset();

        info!(broker = %self.kind, topic = %topic, "Subscription started");

        loop {
            if cancel.is_cancelled() {
                info!(broker = %self.kind, topic = %topic, "Subscription cancelled");
                return Err(MessagingError::Cancelled(topic.to_string()));
            }

            match reader.read().await {
                Err(ReadError::Timeout) => {
                    let Some(delay) = backoff.record_timeout() else {
                        trace!(
                            topic = %topic,
                            consecutive_timeouts = backoff.consecutive_timeouts(),
                            "No message available"
                        );
                        continue;
                    };

                    debug!(
                        topic = %topic,
                        consecutive_timeouts = backoff.consecutive_timeouts(),
                        backoff_ms = delay.as_millis() as u64,
                        "No messages available, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(broker = %self.kind, topic = %topic, "Subscription cancelled");
                            return Err(MessagingError::Cancelled(topic.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(ReadError::Transport(reason)) => {
                    backoff.reset();
                    MESSAGING_METRICS
                        .read_errors
                        .with_label_values(&[topic, broker])
                        .inc();
                    error!(broker = %self.kind, topic = %topic, error = %reason, "Error reading message");
                }
                Ok(message) => {
                    backoff.reset();
                    MESSAGING_METRICS
                        .messages_consumed
                        .with_label_values(&[topic, broker])
                        .inc();

                    let key = message.key.clone();
                    if let Err(e) = handler.handle(message).await {
                        MESSAGING_METRICS
                            .handler_failures
                            .with_label_values(&[topic, broker])
                            .inc();
                        error!(
                            broker = %self.kind,
                            topic = %topic,
                            key = %key,
                            error = %e,
                            "Error processing message"
                        );
                    }

                    if let Err(e) = reader.ack().await {
                        warn!(broker = %self.kind, topic = %topic, key = %key, error = %e, "Failed to acknowledge message");
                    }
                }
            }
        }
    }

    /// Bounded probe through an existing reader, or through a reader on the
    /// default topic when none exists yet. A timeout counts as healthy.
    pub async fn health_check(&self) -> MessagingResult<()> {
        let existing = self.readers.read().await.values().next().cloned();
        let reader = match existing {
            Some(reader) => reader,
            None => self
                .reader(&self.default_topic)
                .await
                .map_err(|e| MessagingError::HealthCheckFailed(format!("{} {}", self.kind, e)))?,
        };

        match reader.probe(self.health_check_timeout).await {
            Ok(()) | Err(ReadError::Timeout) => Ok(()),
            Err(ReadError::Transport(reason)) => {
                warn!(broker = %self.kind, topic = %reader.topic(), error = %reason, "Health check failed");
                Err(MessagingError::HealthCheckFailed(format!(
                    "{} reader on '{}': {}",
                    self.kind,
                    reader.topic(),
                    reason
                )))
            }
        }
    }

    /// Close every reader, then the writer. Every resource is attempted even
    /// when an earlier one fails.
    pub async fn close(&self) -> MessagingResult<()> {
        let readers: Vec<(String, Arc<dyn MessageReader>)> =
            self.readers.write().await.drain().collect();
        let mut failures = Vec::new();

        for (topic, reader) in readers {
            if let Err(e) = reader.close().await {
                error!(broker = %self.kind, topic = %topic, error = %e, "Failed to close reader");
                failures.push(format!("failed to close reader for topic {}: {}", topic, e));
            }
        }

        if let Err(e) = self.writer.close().await {
            error!(broker = %self.kind, error = %e, "Failed to close writer");
            failures.push(format!("failed to close writer: {}", e));
        }

        MessagingError::aggregate(format!("errors closing {} client", self.kind), failures)?;

        info!(broker = %self.kind, "Client closed");
        Ok(())
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("kind", &self.kind)
            .field("default_topic", &self.default_topic)
            .field("idle_backoff", &self.idle_backoff)
            .field("health_check_timeout", &self.health_check_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct NullWriter;

    #[async_trait]
    impl MessageWriter for NullWriter {
        async fn write(&self, _message: &BrokerMessage) -> MessagingResult<()> {
            Ok(())
        }

        async fn close(&self) -> MessagingResult<()> {
            Ok(())
        }
    }

    struct IdleReader(String);

    #[async_trait]
    impl MessageReader for IdleReader {
        fn topic(&self) -> &str {
            &self.0
        }

        async fn read(&self) -> Result<BrokerMessage, ReadError> {
            Err(ReadError::Timeout)
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), ReadError> {
            Err(ReadError::Timeout)
        }

        async fn close(&self) -> MessagingResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        created: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReaderFactory for RecordingFactory {
        async fn create_reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
            self.created.lock().push(topic.to_string());
            Ok(Arc::new(IdleReader(topic.to_string())))
        }
    }

    fn client(factory: Arc<RecordingFactory>) -> BrokerClient {
        BrokerClient::new(BrokerKind::Kafka, "user.events", Arc::new(NullWriter), factory)
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let client = client(Arc::new(RecordingFactory::default()));
        let result = client.publish("", "k", b"{}".to_vec(), HashMap::new()).await;
        assert!(matches!(result, Err(MessagingError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_reader_is_reused() {
        let factory = Arc::new(RecordingFactory::default());
        let client = client(factory.clone());

        let first = client.reader("orders").await.unwrap();
        let second = client.reader("orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*factory.created.lock(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_creates_default_reader() {
        let factory = Arc::new(RecordingFactory::default());
        let client = client(factory.clone());

        assert!(client.health_check().await.is_ok());
        assert_eq!(client.reader_topics().await, vec!["user.events".to_string()]);

        // Second check reuses the existing reader
        assert!(client.health_check().await.is_ok());
        assert_eq!(factory.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_readers() {
        let client = client(Arc::new(RecordingFactory::default()));
        client.reader("a").await.unwrap();
        client.reader("b").await.unwrap();

        assert!(client.close().await.is_ok());
        assert_eq!(client.reader_count().await, 0);
    }
}
