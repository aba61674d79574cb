//! Messaging factory: cached broker clients, supervised subscriptions,
//! aggregated health and shutdown.

use crate::messaging::client::BrokerClient;
use crate::messaging::config::{BrokerKind, MessagingConfig};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::handlers::{default_routes, SubscriptionRoute};
use crate::messaging::supervisor::{
    SubscriptionKey, SubscriptionState, SubscriptionStatus, SubscriptionSupervisor,
};
use crate::messaging::traits::MessageHandler;
use crate::messaging::{kafka, nats};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Builds the client for one broker kind
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(
        &self,
        kind: BrokerKind,
        config: &MessagingConfig,
    ) -> MessagingResult<BrokerClient>;
}

/// Connects to the real brokers
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerConnector;

#[async_trait]
impl ClientConnector for BrokerConnector {
    async fn connect(
        &self,
        kind: BrokerKind,
        config: &MessagingConfig,
    ) -> MessagingResult<BrokerClient> {
        match kind {
            BrokerKind::Kafka => kafka::connect(&config.kafka),
            BrokerKind::Nats => nats::connect(&config.nats).await,
        }
    }
}

/// Single point of access to broker clients.
///
/// At most one client exists per broker kind; it is built on first use.
pub struct MessagingFactory {
    config: Arc<MessagingConfig>,
    connector: Arc<dyn ClientConnector>,
    clients: RwLock<HashMap<BrokerKind, Arc<BrokerClient>>>,
    routes: Vec<SubscriptionRoute>,
    supervisor: Arc<SubscriptionSupervisor>,
}

impl MessagingFactory {
    /// Factory with the real connector and the default routes for `config`
    pub fn new(config: Arc<MessagingConfig>) -> Self {
        let routes = default_routes(&config);
        Self {
            config,
            connector: Arc::new(BrokerConnector),
            clients: RwLock::new(HashMap::new()),
            routes,
            supervisor: Arc::new(SubscriptionSupervisor::new()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn ClientConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace every declared route.
    ///
    /// Only the first route for a given broker and topic is kept.
    pub fn with_routes(mut self, routes: Vec<SubscriptionRoute>) -> Self {
        self.routes = Vec::with_capacity(routes.len());
        for route in routes {
            self.add_route(route);
        }
        self
    }

    /// Declare one more (topic, handler) pair.
    ///
    /// Ignored when the broker already has a route for `topic`.
    pub fn route(
        mut self,
        broker: BrokerKind,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.add_route(SubscriptionRoute {
            broker,
            topic: topic.into(),
            handler,
        });
        self
    }

    fn add_route(&mut self, route: SubscriptionRoute) {
        let duplicate = self
            .routes
            .iter()
            .any(|existing| existing.broker == route.broker && existing.topic == route.topic);

        if duplicate {
            warn!(broker = %route.broker, topic = %route.topic, "Duplicate route ignored");
            return;
        }
        self.routes.push(route);
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn routes(&self) -> &[SubscriptionRoute] {
        &self.routes
    }

    /// Get the cached client for `kind`, connecting on first use
    pub async fn get_client(&self, kind: BrokerKind) -> MessagingResult<Arc<BrokerClient>> {
        if !self.config.is_enabled(kind) {
            return Err(MessagingError::BrokerDisabled(kind.to_string()));
        }

        if let Some(client) = self.clients.read().await.get(&kind) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;

        // Re-check: a concurrent caller may have connected already
        if let Some(client) = clients.get(&kind) {
            return Ok(client.clone());
        }

        let client = Arc::new(self.connector.connect(kind, &self.config).await?);
        clients.insert(kind, client.clone());

        info!(broker = %kind, "Created messaging client");
        Ok(client)
    }

    /// Broker kinds with a constructed client
    pub async fn active_kinds(&self) -> Vec<BrokerKind> {
        let mut kinds: Vec<BrokerKind> = self.clients.read().await.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    /// Launch one supervised task per declared route and return without
    /// waiting for them.
    ///
    /// A route whose subscription is already starting or running is left
    /// alone, so calling this again never doubles a consumer.
    ///
    /// Routes on disabled brokers are skipped. When a broker cannot be
    /// connected its routes are marked failed and the error is returned
    /// after every other broker's routes have been launched.
    pub async fn start_subscriptions(&self, cancel: CancellationToken) -> MessagingResult<()> {
        let mut failures = Vec::new();

        for kind in [BrokerKind::Kafka, BrokerKind::Nats] {
            let routes: Vec<&SubscriptionRoute> =
                self.routes.iter().filter(|route| route.broker == kind).collect();
            if routes.is_empty() {
                continue;
            }

            if !self.config.is_enabled(kind) {
                info!(broker = %kind, "Broker disabled, skipping subscriptions");
                continue;
            }

            let client = match self.get_client(kind).await {
                Ok(client) => client,
                Err(e) => {
                    for route in &routes {
                        self.supervisor.mark(
                            &SubscriptionKey::new(kind, route.topic.clone()),
                            SubscriptionState::Failed {
                                reason: e.to_string(),
                            },
                        );
                    }
                    failures.push(format!("failed to get {} client: {}", kind, e));
                    continue;
                }
            };

            for route in routes {
                self.spawn_subscription(client.clone(), route, cancel.clone());
            }
        }

        MessagingError::aggregate("failed to start subscriptions", failures)
    }

    fn spawn_subscription(
        &self,
        client: Arc<BrokerClient>,
        route: &SubscriptionRoute,
        cancel: CancellationToken,
    ) {
        let key = SubscriptionKey::new(route.broker, route.topic.clone());
        let supervisor = self.supervisor.clone();
        let handler = route.handler.clone();

        if !supervisor.claim(&key) {
            warn!(subscription = %key, "Subscription already active, not starting another");
            return;
        }
        info!(subscription = %key, "Starting subscription");

        let task_supervisor = supervisor.clone();
        let handle = tokio::spawn(async move {
            task_supervisor.mark(&key, SubscriptionState::Running);

            let outcome = AssertUnwindSafe(client.subscribe(cancel, &key.topic, handler))
                .catch_unwind()
                .await;

            let state = match outcome {
                Ok(Ok(())) => SubscriptionState::Stopped,
                Ok(Err(e)) if e.is_cancelled() => SubscriptionState::Stopped,
                Ok(Err(e)) => {
                    error!(subscription = %key, error = %e, "Subscription error");
                    SubscriptionState::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(subscription = %key, reason = %reason, "Subscription task panicked");
                    SubscriptionState::Failed {
                        reason: format!("panicked: {}", reason),
                    }
                }
            };

            task_supervisor.mark(&key, state);
        });

        supervisor.track(handle);
    }

    /// Check every constructed client and every supervised subscription.
    ///
    /// Brokers whose client was never built are not checked.
    pub async fn health_check(&self) -> MessagingResult<()> {
        let clients: Vec<(BrokerKind, Arc<BrokerClient>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(kind, client)| (*kind, client.clone()))
            .collect();

        let mut failures = Vec::new();
        for (kind, client) in clients {
            if let Err(e) = client.health_check().await {
                error!(broker = %kind, error = %e, "Messaging health check failed");
                failures.push(format!("{} health check failed: {}", kind, e));
            }
        }
        failures.extend(self.supervisor.failures());

        MessagingError::aggregate("messaging health check failed", failures)
    }

    pub fn subscription_states(&self) -> Vec<SubscriptionStatus> {
        self.supervisor.snapshot()
    }

    /// Join subscription tasks after cancellation; returns how many had to be aborted
    pub async fn wait_for_subscriptions(&self, timeout: Duration) -> usize {
        self.supervisor.join_all(timeout).await
    }

    /// Close every constructed client, attempting all of them
    pub async fn close(&self) -> MessagingResult<()> {
        let clients: Vec<(BrokerKind, Arc<BrokerClient>)> =
            self.clients.write().await.drain().collect();
        let mut failures = Vec::new();

        for (kind, client) in clients {
            if let Err(e) = client.close().await {
                error!(broker = %kind, error = %e, "Failed to close messaging client");
                failures.push(format!("failed to close {} client: {}", kind, e));
            }
        }

        MessagingError::aggregate("errors closing messaging clients", failures)
    }
}

impl std::fmt::Debug for MessagingFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingFactory")
            .field("routes", &self.routes)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::BrokerMessage;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("bad handler");
        assert_eq!(panic_message(boxed.as_ref()), "bad handler");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_disabled_broker_is_rejected() {
        let factory = MessagingFactory::new(Arc::new(MessagingConfig::default()));

        let err = factory.get_client(BrokerKind::Nats).await.unwrap_err();
        assert!(matches!(err, MessagingError::BrokerDisabled(_)));
        assert!(factory.health_check().await.is_ok());
    }

    #[test]
    fn test_default_factory_routes() {
        let factory = MessagingFactory::new(Arc::new(MessagingConfig::default()));
        assert_eq!(factory.routes().len(), 2);
    }

    #[test]
    fn test_duplicate_routes_are_ignored() {
        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_message: BrokerMessage| async { Ok::<(), anyhow::Error>(()) });

        let factory = MessagingFactory::new(Arc::new(MessagingConfig::default()))
            .with_routes(Vec::new())
            .route(BrokerKind::Kafka, "orders", handler.clone())
            .route(BrokerKind::Kafka, "orders", handler.clone())
            .route(BrokerKind::Nats, "orders", handler);

        let routes: Vec<(BrokerKind, &str)> = factory
            .routes()
            .iter()
            .map(|route| (route.broker, route.topic.as_str()))
            .collect();
        assert_eq!(routes, vec![(BrokerKind::Kafka, "orders"), (BrokerKind::Nats, "orders")]);
    }
}
