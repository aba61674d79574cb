//! In-memory transports and helpers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_copier::messaging::{
    BrokerClient, BrokerKind, BrokerMessage, ClientConnector, MessageReader, MessageWriter,
    MessagingConfig, MessagingError, MessagingResult, ReadError, ReaderFactory,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Topic queues shared by a writer and its readers
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<BrokerMessage>>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, message: BrokerMessage) {
        self.queues
            .lock()
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
    }

    pub fn pop(&self, topic: &str) -> Option<BrokerMessage> {
        self.queues.lock().get_mut(topic).and_then(VecDeque::pop_front)
    }

    pub fn len(&self, topic: &str) -> usize {
        self.queues.lock().get(topic).map_or(0, VecDeque::len)
    }
}

pub struct InMemoryWriter {
    broker: Arc<InMemoryBroker>,
    pub writes: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_write: bool,
    pub fail_close: bool,
}

impl InMemoryWriter {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            writes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_write: false,
            fail_close: false,
        }
    }

    pub fn failing_write(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            fail_write: true,
            ..Self::new(broker)
        }
    }

    pub fn failing_close(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            fail_close: true,
            ..Self::new(broker)
        }
    }
}

#[async_trait]
impl MessageWriter for InMemoryWriter {
    async fn write(&self, message: &BrokerMessage) -> MessagingResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_write {
            return Err(MessagingError::PublishFailed(format!(
                "broker rejected write to {}",
                message.topic
            )));
        }
        self.broker.push(message.clone());
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(MessagingError::CloseFailed("writer close failed".to_string()));
        }
        Ok(())
    }
}

/// Pops from the shared broker; an empty queue waits `poll` and reports a timeout
pub struct InMemoryReader {
    topic: String,
    broker: Arc<InMemoryBroker>,
    poll: Duration,
    pub closes: AtomicUsize,
    fail_close: bool,
    fail_probe: bool,
}

#[async_trait]
impl MessageReader for InMemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&self) -> Result<BrokerMessage, ReadError> {
        if let Some(message) = self.broker.pop(&self.topic) {
            return Ok(message);
        }
        tokio::time::sleep(self.poll).await;
        self.broker.pop(&self.topic).ok_or(ReadError::Timeout)
    }

    async fn probe(&self, _timeout: Duration) -> Result<(), ReadError> {
        if self.fail_probe {
            return Err(ReadError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(MessagingError::CloseFailed(format!(
                "reader {} close failed",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Builds [`InMemoryReader`]s and records every creation
pub struct InMemoryReaderFactory {
    broker: Arc<InMemoryBroker>,
    pub poll: Duration,
    pub create_delay: Duration,
    pub fail_close: bool,
    pub fail_probe: bool,
    pub broken_topics: HashSet<String>,
    pub created: Mutex<Vec<String>>,
    pub readers: Mutex<Vec<Arc<InMemoryReader>>>,
}

impl InMemoryReaderFactory {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            poll: Duration::from_millis(10),
            create_delay: Duration::ZERO,
            fail_close: false,
            fail_probe: false,
            broken_topics: HashSet::new(),
            created: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ReaderFactory for InMemoryReaderFactory {
    async fn create_reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.broken_topics.contains(topic) {
            return Err(MessagingError::SubscribeFailed(format!(
                "unknown topic {}",
                topic
            )));
        }

        self.created.lock().push(topic.to_string());
        let reader = Arc::new(InMemoryReader {
            topic: topic.to_string(),
            broker: self.broker.clone(),
            poll: self.poll,
            closes: AtomicUsize::new(0),
            fail_close: self.fail_close,
            fail_probe: self.fail_probe,
        });
        self.readers.lock().push(reader.clone());
        Ok(reader)
    }
}

/// One scripted read outcome
#[derive(Clone)]
pub enum Step {
    Message(BrokerMessage),
    Timeout,
    Transport(&'static str),
}

/// Replays a script, then times out forever. Records the instant of every
/// read and cancels `cancel_after` once that many reads have happened.
pub struct ScriptedReader {
    topic: String,
    script: Mutex<VecDeque<Step>>,
    pub reads: Mutex<Vec<tokio::time::Instant>>,
    pub acks: AtomicUsize,
    read_delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedReader {
    pub fn new(topic: &str, script: Vec<Step>) -> Self {
        Self {
            topic: topic.to_string(),
            script: Mutex::new(script.into()),
            reads: Mutex::new(Vec::new()),
            acks: AtomicUsize::new(0),
            read_delay: Duration::ZERO,
            cancel_after: None,
        }
    }

    /// Each read blocks this long before returning its outcome
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn cancel_after(mut self, reads: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((reads, token));
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageReader for ScriptedReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&self) -> Result<BrokerMessage, ReadError> {
        let count = {
            let mut reads = self.reads.lock();
            reads.push(tokio::time::Instant::now());
            reads.len()
        };

        if let Some((limit, token)) = &self.cancel_after {
            if count >= *limit {
                token.cancel();
            }
        }

        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }

        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Message(message)) => Ok(message),
            Some(Step::Transport(reason)) => Err(ReadError::Transport(reason.to_string())),
            Some(Step::Timeout) | None => Err(ReadError::Timeout),
        }
    }

    async fn probe(&self, _timeout: Duration) -> Result<(), ReadError> {
        Err(ReadError::Timeout)
    }

    async fn ack(&self) -> MessagingResult<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }
}

/// Hands out one pre-built reader
pub struct SingleReaderFactory(pub Arc<dyn MessageReader>);

#[async_trait]
impl ReaderFactory for SingleReaderFactory {
    async fn create_reader(&self, _topic: &str) -> MessagingResult<Arc<dyn MessageReader>> {
        Ok(self.0.clone())
    }
}

pub struct NullWriter;

#[async_trait]
impl MessageWriter for NullWriter {
    async fn write(&self, _message: &BrokerMessage) -> MessagingResult<()> {
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }
}

/// Client over a single scripted reader
pub fn scripted_client(reader: Arc<ScriptedReader>) -> BrokerClient {
    BrokerClient::new(
        BrokerKind::Kafka,
        "user.events",
        Arc::new(NullWriter),
        Arc::new(SingleReaderFactory(reader)),
    )
}

/// Connector that builds in-memory clients and counts connections
pub struct InMemoryConnector {
    pub broker: Arc<InMemoryBroker>,
    pub connects: AtomicUsize,
    pub connect_delay: Duration,
    pub fail: bool,
    pub fail_probe: bool,
    pub broken_topics: HashSet<String>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            broker: InMemoryBroker::new(),
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            fail: false,
            fail_probe: false,
            broken_topics: HashSet::new(),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientConnector for InMemoryConnector {
    async fn connect(
        &self,
        kind: BrokerKind,
        config: &MessagingConfig,
    ) -> MessagingResult<BrokerClient> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.fail {
            return Err(MessagingError::ConnectionFailed(format!(
                "{} unreachable",
                kind
            )));
        }

        let mut factory = InMemoryReaderFactory::new(self.broker.clone());
        factory.broken_topics = self.broken_topics.clone();
        factory.fail_probe = self.fail_probe;

        Ok(BrokerClient::new(
            kind,
            config.topics(kind).events.clone(),
            Arc::new(InMemoryWriter::new(self.broker.clone())),
            Arc::new(factory),
        ))
    }
}

/// Messaging config with only Kafka enabled
pub fn kafka_only_config() -> MessagingConfig {
    let mut config = MessagingConfig::default();
    config.kafka.enabled = true;
    config.nats.enabled = false;
    config
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Metric family names present in a Prometheus text exposition
pub fn metric_names(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter(|line| line.starts_with("# TYPE"))
        .filter_map(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
        .collect()
}
