//! Default handlers for the declared user streams

use crate::messaging::config::{BrokerKind, MessagingConfig};
use crate::messaging::message::BrokerMessage;
use crate::messaging::traits::MessageHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Logical stream a topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Events,
    Commands,
    Queries,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Commands => "commands",
            Self::Queries => "queries",
        }
    }
}

/// A (topic, handler) pair the factory subscribes at startup
#[derive(Clone)]
pub struct SubscriptionRoute {
    pub broker: BrokerKind,
    pub topic: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for SubscriptionRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRoute")
            .field("broker", &self.broker)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Logs every message it receives. The payload is rendered as JSON when it
/// parses, otherwise as lossy UTF-8.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    broker: BrokerKind,
    stream: StreamKind,
}

impl LoggingHandler {
    pub fn new(broker: BrokerKind, stream: StreamKind) -> Self {
        Self { broker, stream }
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        let value = match message.json::<serde_json::Value>() {
            Ok(json) => json.to_string(),
            Err(_) => String::from_utf8_lossy(&message.value).into_owned(),
        };

        info!(
            broker = %self.broker,
            stream = self.stream.as_str(),
            topic = %message.topic,
            key = %message.key,
            value = %value,
            "Processing message"
        );
        Ok(())
    }
}

/// Routes for every enabled broker's declared streams.
///
/// Kafka subscribes events and commands; NATS also subscribes queries when a
/// queries subject is configured.
pub fn default_routes(config: &MessagingConfig) -> Vec<SubscriptionRoute> {
    let mut routes = Vec::new();

    for kind in config.enabled_kinds() {
        let topics = config.topics(kind);
        let mut streams = vec![
            (StreamKind::Events, topics.events.clone()),
            (StreamKind::Commands, topics.commands.clone()),
        ];
        if kind == BrokerKind::Nats {
            if let Some(queries) = &topics.queries {
                streams.push((StreamKind::Queries, queries.clone()));
            }
        }

        for (stream, topic) in streams {
            if topic.is_empty() {
                continue;
            }
            routes.push(SubscriptionRoute {
                broker: kind,
                topic,
                handler: Arc::new(LoggingHandler::new(kind, stream)),
            });
        }
    }

    routes
}
