//! NATS JetStream transport

use crate::messaging::client::BrokerClient;
use crate::messaging::config::{BrokerKind, NatsConfig, StreamConfig};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message::BrokerMessage;
use crate::messaging::traits::{MessageReader, MessageWriter, ReadError, ReaderFactory};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream::StorageType};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Header carrying the message key, NATS has no native key
pub const KEY_HEADER: &str = "Message-Key";

/// Stream provisioning attempts
const STREAM_ATTEMPTS: u32 = 3;

/// Build a NATS-backed [`BrokerClient`]
pub async fn connect(config: &NatsConfig) -> MessagingResult<BrokerClient> {
    let mut options = ConnectOptions::new()
        .name(&config.client_id)
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_millis(config.request_timeout_ms)));

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        options = options.user_and_password(user.clone(), password.clone());
    }

    let client = async_nats::connect_with_options(config.servers.join(",").as_str(), options)
        .await
        .map_err(|e| MessagingError::ConnectionFailed(format!("NATS connection failed: {}", e)))?;

    let jetstream = jetstream::new(client.clone());

    if let Err(e) = ensure_streams(&jetstream, &config.streams).await {
        warn!(error = %e, "JetStream stream initialization failed");
    }

    info!(servers = ?config.servers, client_id = %config.client_id, "NATS client ready");

    Ok(BrokerClient::new(
        BrokerKind::Nats,
        config.subjects.events.clone(),
        Arc::new(NatsWriter {
            client: client.clone(),
            jetstream: jetstream.clone(),
        }),
        Arc::new(NatsReaderFactory {
            client,
            jetstream,
            queue_group: config.queue_group.clone(),
            max_wait: config.consumer.max_wait(),
        }),
    )
    .with_idle_backoff(config.consumer.idle_backoff())
    .with_health_check_timeout(config.consumer.health_check_timeout()))
}

/// Create every declared stream that does not exist yet, retrying the whole
/// set with a linear delay.
pub async fn ensure_streams(
    jetstream: &jetstream::Context,
    streams: &[StreamConfig],
) -> MessagingResult<()> {
    let mut last_error = None;

    for attempt in 1..=STREAM_ATTEMPTS {
        match create_streams(jetstream, streams).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "Stream creation failed, retrying");
                last_error = Some(e);
            }
        }

        if attempt < STREAM_ATTEMPTS {
            tokio::time::sleep(stream_retry_delay(attempt)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| {
        MessagingError::ConfigurationError("no streams attempted".to_string())
    }))
}

async fn create_streams(
    jetstream: &jetstream::Context,
    streams: &[StreamConfig],
) -> MessagingResult<()> {
    for stream in streams {
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream.name.clone(),
                subjects: stream.subjects.clone(),
                storage: StorageType::File,
                max_age: Duration::from_secs(stream.max_age_secs),
                max_messages: stream.max_messages,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                MessagingError::ConfigurationError(format!(
                    "failed to create JetStream stream {}: {}",
                    stream.name, e
                ))
            })?;

        info!(stream = %stream.name, "Stream ready");
    }

    Ok(())
}

/// Delay after a failed provisioning attempt
pub fn stream_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100) * attempt
}

/// Durable consumer name for a subject within a queue group.
///
/// Durable names may not contain `.`, `*` or `>`.
pub fn durable_name(queue_group: &str, subject: &str) -> String {
    format!("{}-{}", queue_group, subject)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Timeouts surface from async-nats only as text
pub fn is_timeout_message(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("timed out") || text.contains("timeout") || text.contains("no messages")
}

fn classify(text: String) -> ReadError {
    if is_timeout_message(&text) {
        ReadError::Timeout
    } else {
        ReadError::Transport(text)
    }
}

fn connection_probe(client: &Client) -> Result<(), ReadError> {
    match client.connection_state() {
        State::Connected => Ok(()),
        state => Err(ReadError::Transport(format!("NATS connection is {:?}", state))),
    }
}

/// JetStream publisher
pub struct NatsWriter {
    client: Client,
    jetstream: jetstream::Context,
}

#[async_trait]
impl MessageWriter for NatsWriter {
    async fn write(&self, message: &BrokerMessage) -> MessagingResult<()> {
        let mut headers = HeaderMap::new();
        for (key, value) in &message.headers {
            headers.insert(key.as_str(), value.as_str());
        }
        if !message.key.is_empty() {
            headers.insert(KEY_HEADER, message.key.as_str());
        }

        self.jetstream
            .publish_with_headers(message.topic.clone(), headers, message.value.clone().into())
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("NATS publish failed: {}", e)))?
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("NATS ack failed: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::CloseFailed(format!("NATS flush failed: {}", e)))
    }
}

/// Creates one durable pull consumer per subject
pub struct NatsReaderFactory {
    client: Client,
    jetstream: jetstream::Context,
    queue_group: String,
    max_wait: Duration,
}

#[async_trait]
impl ReaderFactory for NatsReaderFactory {
    async fn create_reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
        let stream_name = self.jetstream.stream_by_subject(topic).await.map_err(|e| {
            MessagingError::SubscribeFailed(format!("no JetStream stream for subject {}: {}", topic, e))
        })?;

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("failed to get stream {}: {}", stream_name, e)))?;

        let name = durable_name(&self.queue_group, topic);
        let consumer = stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: topic.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("failed to create consumer {}: {}", name, e)))?;

        info!(subject = %topic, stream = %stream_name, consumer = %name, "NATS reader attached");

        Ok(Arc::new(NatsReader {
            subject: topic.to_string(),
            client: self.client.clone(),
            consumer,
            max_wait: self.max_wait,
            pending: Mutex::new(None),
        }))
    }
}

/// Durable pull consumer on one subject
pub struct NatsReader {
    subject: String,
    client: Client,
    consumer: jetstream::consumer::Consumer<pull::Config>,
    max_wait: Duration,
    /// Last message handed out, acked once its handler returns
    pending: Mutex<Option<jetstream::Message>>,
}

#[async_trait]
impl MessageReader for NatsReader {
    fn topic(&self) -> &str {
        &self.subject
    }

    async fn read(&self) -> Result<BrokerMessage, ReadError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(self.max_wait)
            .messages()
            .await
            .map_err(|e| classify(e.to_string()))?;

        let message = match batch.next().await {
            None => return Err(ReadError::Timeout),
            Some(Err(e)) => return Err(classify(e.to_string())),
            Some(Ok(message)) => message,
        };

        let mut headers = HashMap::new();
        if let Some(map) = &message.headers {
            for (name, values) in map.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        let key = headers.remove(KEY_HEADER).unwrap_or_default();

        let decoded = BrokerMessage::new(message.subject.to_string(), key, message.payload.to_vec())
            .with_headers(headers);

        *self.pending.lock() = Some(message);
        Ok(decoded)
    }

    /// Connection state is known locally, so the probe never waits
    async fn probe(&self, _timeout: Duration) -> Result<(), ReadError> {
        connection_probe(&self.client)
    }

    async fn ack(&self) -> MessagingResult<()> {
        let Some(message) = self.pending.lock().take() else {
            return Ok(());
        };

        message.ack().await.map_err(|e| {
            MessagingError::ConnectionFailed(format!("NATS ack failed on {}: {}", self.subject, e))
        })
    }

    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }
}
