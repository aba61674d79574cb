//! Asynchronous messaging integration layer
//!
//! Broker clients for Kafka and NATS JetStream behind one publish/subscribe
//! contract, created lazily and shared through [`MessagingFactory`].
//!
//! # Features
//!
//! - **Lazy clients**: at most one client per broker kind, one reader per topic
//! - **Adaptive polling**: idle topics back off linearly up to a cap
//! - **Supervised subscriptions**: failed or panicking loops fail the health check
//! - **At-least-once delivery**: messages are acknowledged after the handler
//!   returns; handler errors are logged and the loop moves on
//! - **Metrics Integration**: Prometheus counters for publish and consume paths
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               MessagingFactory                   │
//! ├─────────────────────────────────────────────────┤
//! │  - get_client()        - start_subscriptions()   │
//! │  - health_check()      - close()                 │
//! └─────────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────────┐
//! │                 BrokerClient                     │
//! ├─────────────────────────────────────────────────┤
//! │  - publish()  - subscribe()  - health_check()    │
//! │  MessageWriter + per-topic MessageReader map     │
//! └─────────────────────────────────────────────────┘
//!           │                        │
//!           ▼                        ▼
//! ┌──────────────────┐    ┌──────────────────┐
//! │  Kafka transport │    │  NATS JetStream  │
//! ├──────────────────┤    ├──────────────────┤
//! │ - rdkafka        │    │ - durable pull   │
//! │ - group consumer │    │   consumers      │
//! └──────────────────┘    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use signal_copier::messaging::{BrokerKind, MessagingConfig, MessagingFactory};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = MessagingFactory::new(Arc::new(MessagingConfig::default()));
//!     let client = factory.get_client(BrokerKind::Kafka).await?;
//!
//!     client
//!         .publish_json("orders", "42", &serde_json::json!({"qty": 3}), HashMap::new())
//!         .await?;
//!
//!     factory.close().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod client;
mod config;
mod error;
mod factory;
mod handlers;
pub mod kafka;
mod message;
mod metrics;
pub mod nats;
mod supervisor;
mod traits;

pub use backoff::IdleBackoff;
pub use client::{BrokerClient, DEFAULT_HEALTH_CHECK_TIMEOUT};
pub use config::{
    BrokerKind, ConsumerTuning, KafkaConfig, MessagingConfig, NatsConfig, OffsetReset,
    ProducerTuning, RequiredAcks, SaslConfig, StreamConfig, TopicConfig,
};
pub use error::{MessagingError, MessagingResult};
pub use factory::{BrokerConnector, ClientConnector, MessagingFactory};
pub use handlers::{default_routes, LoggingHandler, StreamKind, SubscriptionRoute};
pub use message::BrokerMessage;
pub use metrics::{gather_metrics, init_messaging_metrics, MESSAGING_METRICS};
pub use supervisor::{
    SubscriptionKey, SubscriptionState, SubscriptionStatus, SubscriptionSupervisor,
};
pub use traits::{MessageHandler, MessageReader, MessageWriter, ReadError, ReaderFactory};
