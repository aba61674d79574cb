//! Messaging configuration

use crate::messaging::backoff::IdleBackoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broker kind served by the messaging factory
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// Kafka - durable partitioned log
    Kafka,
    /// NATS JetStream
    Nats,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "kafka",
            BrokerKind::Nats => "nats",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Acknowledgement level a publish waits for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// Fire and forget
    None,
    /// Partition leader only
    #[default]
    One,
    /// All in-sync replicas
    All,
}

impl RequiredAcks {
    /// Value of the librdkafka `acks` property
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::One => "1",
            RequiredAcks::All => "all",
        }
    }
}

/// Logical stream names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    /// Domain events
    #[serde(default = "default_events_topic")]
    pub events: String,

    /// Commands
    #[serde(default = "default_commands_topic")]
    pub commands: String,

    /// Request/reply queries (NATS only)
    #[serde(default)]
    pub queries: Option<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            events: default_events_topic(),
            commands: default_commands_topic(),
            queries: None,
        }
    }
}

/// Consumer tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumerTuning {
    /// Maximum bytes per fetch
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Wait window of a single read, in seconds
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Offset reset policy for new groups
    #[serde(default)]
    pub offset_reset: OffsetReset,

    /// Idle reads tolerated before backing off
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u32,

    /// Backoff step in milliseconds
    #[serde(default = "default_idle_backoff_base_ms")]
    pub idle_backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_idle_backoff_max_ms")]
    pub idle_backoff_max_ms: u64,

    /// Bound on a health probe, in seconds
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

impl ConsumerTuning {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn idle_backoff(&self) -> IdleBackoff {
        IdleBackoff::new(
            self.idle_threshold,
            Duration::from_millis(self.idle_backoff_base_ms),
            Duration::from_millis(self.idle_backoff_max_ms),
        )
    }
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_wait_secs: default_max_wait_secs(),
            offset_reset: OffsetReset::default(),
            idle_threshold: default_idle_threshold(),
            idle_backoff_base_ms: default_idle_backoff_base_ms(),
            idle_backoff_max_ms: default_idle_backoff_max_ms(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

/// Producer tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerTuning {
    /// Acknowledgement level
    #[serde(default)]
    pub required_acks: RequiredAcks,

    /// Delivery attempts made by the transport itself
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Local queue + delivery timeout in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Compression type (none, gzip, snappy, lz4, zstd)
    #[serde(default = "default_compression_type")]
    pub compression_type: String,
}

impl ProducerTuning {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ProducerTuning {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::default(),
            max_attempts: default_max_attempts(),
            send_timeout_ms: default_send_timeout_ms(),
            compression_type: default_compression_type(),
        }
    }
}

/// SASL credentials
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaslConfig {
    /// PLAIN, SCRAM-SHA-256, SCRAM-SHA-512
    pub mechanism: String,
    pub username: String,
    pub password: String,
    /// SASL_SSL or SASL_PLAINTEXT
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
}

impl fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslConfig")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .field("security_protocol", &self.security_protocol)
            .finish()
    }
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Administrative switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bootstrap brokers, in order
    #[serde(default = "default_kafka_brokers")]
    pub brokers: Vec<String>,

    /// Client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Stream names
    #[serde(default)]
    pub topics: TopicConfig,

    #[serde(default)]
    pub consumer: ConsumerTuning,

    #[serde(default)]
    pub producer: ProducerTuning,

    /// Optional SASL authentication
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
}

impl KafkaConfig {
    /// Comma-joined `bootstrap.servers` value
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            brokers: default_kafka_brokers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            topics: TopicConfig::default(),
            consumer: ConsumerTuning::default(),
            producer: ProducerTuning::default(),
            sasl: None,
        }
    }
}

/// JetStream stream declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    #[serde(default = "default_stream_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_stream_max_messages")]
    pub max_messages: i64,
}

/// NATS configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Administrative switch
    #[serde(default)]
    pub enabled: bool,

    /// NATS server URLs
    #[serde(default = "default_nats_servers")]
    pub servers: Vec<String>,

    /// Connection name
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Queue group; also names the durable consumers
    #[serde(default = "default_queue_group")]
    pub queue_group: String,

    /// Subject names
    #[serde(default = "default_nats_subjects")]
    pub subjects: TopicConfig,

    /// Streams provisioned on connect
    #[serde(default = "default_nats_streams")]
    pub streams: Vec<StreamConfig>,

    #[serde(default)]
    pub consumer: ConsumerTuning,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for NatsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsConfig")
            .field("enabled", &self.enabled)
            .field("servers", &self.servers)
            .field("client_id", &self.client_id)
            .field("queue_group", &self.queue_group)
            .field("subjects", &self.subjects)
            .field("streams", &self.streams)
            .field("consumer", &self.consumer)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: default_nats_servers(),
            client_id: default_client_id(),
            queue_group: default_queue_group(),
            subjects: default_nats_subjects(),
            streams: default_nats_streams(),
            consumer: ConsumerTuning::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            user: None,
            password: None,
        }
    }
}

/// Main messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagingConfig {
    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub nats: NatsConfig,
}

impl MessagingConfig {
    /// Whether a broker kind is administratively enabled
    pub fn is_enabled(&self, kind: BrokerKind) -> bool {
        match kind {
            BrokerKind::Kafka => self.kafka.enabled,
            BrokerKind::Nats => self.nats.enabled,
        }
    }

    /// Stream names for a broker kind
    pub fn topics(&self, kind: BrokerKind) -> &TopicConfig {
        match kind {
            BrokerKind::Kafka => &self.kafka.topics,
            BrokerKind::Nats => &self.nats.subjects,
        }
    }

    /// Consumer tuning for a broker kind
    pub fn consumer(&self, kind: BrokerKind) -> &ConsumerTuning {
        match kind {
            BrokerKind::Kafka => &self.kafka.consumer,
            BrokerKind::Nats => &self.nats.consumer,
        }
    }

    /// Enabled broker kinds
    pub fn enabled_kinds(&self) -> Vec<BrokerKind> {
        [BrokerKind::Kafka, BrokerKind::Nats]
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_events_topic() -> String {
    "user.events".to_string()
}

fn default_commands_topic() -> String {
    "user.commands".to_string()
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_wait_secs() -> u64 {
    1
}

fn default_idle_threshold() -> u32 {
    crate::messaging::backoff::DEFAULT_IDLE_THRESHOLD
}

fn default_idle_backoff_base_ms() -> u64 {
    100
}

fn default_idle_backoff_max_ms() -> u64 {
    5_000
}

fn default_health_check_timeout_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_compression_type() -> String {
    "none".to_string()
}

fn default_security_protocol() -> String {
    "SASL_SSL".to_string()
}

fn default_kafka_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "copier".to_string()
}

fn default_group_id() -> String {
    "copier-group".to_string()
}

fn default_nats_servers() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_queue_group() -> String {
    "copier-workers".to_string()
}

fn default_nats_subjects() -> TopicConfig {
    TopicConfig {
        events: default_events_topic(),
        commands: default_commands_topic(),
        queries: Some("user.queries".to_string()),
    }
}

fn default_nats_streams() -> Vec<StreamConfig> {
    vec![
        StreamConfig {
            name: "USER_EVENTS".to_string(),
            subjects: vec![default_events_topic(), default_commands_topic()],
            max_age_secs: default_stream_max_age_secs(),
            max_messages: default_stream_max_messages(),
        },
        StreamConfig {
            name: "USER_QUERIES".to_string(),
            subjects: vec!["user.queries".to_string()],
            max_age_secs: default_stream_max_age_secs(),
            max_messages: default_stream_max_messages(),
        },
    ]
}

fn default_stream_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_stream_max_messages() -> i64 {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5_000
}
