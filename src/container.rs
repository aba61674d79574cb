//! Process lifecycle: database, cache and messaging, opened in order and
//! closed in reverse.

use crate::config::{AppConfig, CacheConfig, DatabaseConfig};
use crate::error::{AppError, Result};
use crate::messaging::{
    init_messaging_metrics, BrokerConnector, ClientConnector, MessagingFactory, SubscriptionRoute,
    SubscriptionStatus,
};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default time subscription tasks get to stop on close
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// Health of one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// Aggregated health of the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceHealth>,
    pub subscriptions: Vec<SubscriptionStatus>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Default)]
struct Resources {
    database: Option<PgPool>,
    cache: Option<ConnectionManager>,
    messaging: Option<Arc<MessagingFactory>>,
}

struct Inner {
    state: ContainerState,
    resources: Resources,
}

/// Holds the shared resources for the life of the process.
///
/// Built once in `main` and shared as `Arc<Container>`. Call
/// [`Container::initialize`] once at startup and [`Container::close`] on every
/// exit path, including after a failed initialize.
pub struct Container {
    config: Arc<AppConfig>,
    connector: Arc<dyn ClientConnector>,
    routes: Option<Vec<SubscriptionRoute>>,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
    inner: RwLock<Inner>,
}

impl Container {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            connector: Arc::new(BrokerConnector),
            routes: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            shutdown: CancellationToken::new(),
            inner: RwLock::new(Inner {
                state: ContainerState::Uninitialized,
                resources: Resources::default(),
            }),
        }
    }

    /// Use a different broker connector
    pub fn with_connector(mut self, connector: Arc<dyn ClientConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the default subscription routes
    pub fn with_routes(mut self, routes: Vec<SubscriptionRoute>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Token cancelled when the container starts closing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn state(&self) -> ContainerState {
        self.inner.read().await.state
    }

    /// Open the database, the cache and the messaging factory, then start
    /// the declared subscriptions.
    ///
    /// A database failure aborts startup; resources opened so far stay open
    /// until [`Container::close`]. Cache and subscription failures are logged
    /// and startup continues.
    pub async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.write().await;

        match inner.state {
            ContainerState::Uninitialized => {}
            ContainerState::Ready => return Ok(()),
            ContainerState::Initializing => {
                return Err(AppError::Lifecycle(
                    "a previous initialization did not complete; close the container".to_string(),
                ))
            }
            ContainerState::Closing | ContainerState::Closed => {
                return Err(AppError::Lifecycle("container is closed".to_string()))
            }
        }

        inner.state = ContainerState::Initializing;
        info!(
            service = %self.config.service.name,
            version = %self.config.service.version,
            mode = ?self.config.service.mode,
            "Initializing container"
        );

        init_messaging_metrics();

        if self.config.database.enabled {
            let pool = connect_database(&self.config.database).await?;
            inner.resources.database = Some(pool);
            info!("✅ Database connected");
        } else {
            info!("Database disabled in configuration");
        }

        if self.config.cache.enabled {
            match connect_cache(&self.config.cache).await {
                Ok(cache) => {
                    inner.resources.cache = Some(cache);
                    info!("✅ Cache connected");
                }
                Err(e) => {
                    warn!(error = %e, "⚠️  Cache connection failed, continuing without cache");
                }
            }
        } else {
            info!("Cache disabled in configuration");
        }

        let mut factory = MessagingFactory::new(Arc::new(self.config.messaging.clone()))
            .with_connector(self.connector.clone());
        if let Some(routes) = &self.routes {
            factory = factory.with_routes(routes.clone());
        }
        let factory = Arc::new(factory);
        inner.resources.messaging = Some(factory.clone());
        info!("✅ Messaging factory initialized");

        if let Err(e) = factory.start_subscriptions(self.shutdown.clone()).await {
            warn!(error = %e, "⚠️  Failed to start some subscriptions");
        }

        inner.state = ContainerState::Ready;
        info!("✅ Container ready");
        Ok(())
    }

    /// Tear down in reverse order: cancel subscriptions, close the brokers,
    /// the cache, then the database. Safe to call in any state; every
    /// resource is attempted.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.state == ContainerState::Closed {
            return Ok(());
        }

        inner.state = ContainerState::Closing;
        info!("Closing container");
        self.shutdown.cancel();

        let mut failures = Vec::new();

        if let Some(factory) = inner.resources.messaging.take() {
            let aborted = factory.wait_for_subscriptions(self.shutdown_grace).await;
            if aborted > 0 {
                warn!(aborted, "Aborted subscription tasks during shutdown");
            }
            if let Err(e) = factory.close().await {
                error!(error = %e, "Failed to close messaging");
                failures.push(e.to_string());
            }
        }

        if inner.resources.cache.take().is_some() {
            info!("Cache connection released");
        }

        if let Some(pool) = inner.resources.database.take() {
            pool.close().await;
            info!("Database pool closed");
        }

        inner.state = ContainerState::Closed;

        if failures.is_empty() {
            info!("Container closed");
            Ok(())
        } else {
            Err(AppError::Lifecycle(format!(
                "errors closing container: {}",
                failures.join("; ")
            )))
        }
    }

    pub async fn database(&self) -> Result<PgPool> {
        let inner = self.inner.read().await;
        inner
            .resources
            .database
            .clone()
            .ok_or_else(|| AppError::Lifecycle("database is not available".to_string()))
    }

    /// Cache handle, `None` when disabled or unreachable at startup
    pub async fn cache(&self) -> Option<ConnectionManager> {
        self.inner.read().await.resources.cache.clone()
    }

    pub async fn messaging(&self) -> Result<Arc<MessagingFactory>> {
        let inner = self.inner.read().await;
        inner
            .resources
            .messaging
            .clone()
            .ok_or_else(|| AppError::Lifecycle("messaging is not initialized".to_string()))
    }

    /// Check every dependency. Status is `degraded` when any of them errors.
    pub async fn health(&self) -> HealthReport {
        let (database, cache, messaging) = {
            let inner = self.inner.read().await;
            (
                inner.resources.database.clone(),
                inner.resources.cache.clone(),
                inner.resources.messaging.clone(),
            )
        };

        let mut services = BTreeMap::new();
        let mut subscriptions = Vec::new();

        let messaging_health = match &messaging {
            Some(factory) => {
                subscriptions = factory.subscription_states();
                match factory.health_check().await {
                    Ok(()) => ServiceHealth::ok(),
                    Err(e) => ServiceHealth::error(e.to_string()),
                }
            }
            None => ServiceHealth::error("messaging is not initialized"),
        };
        services.insert("messaging".to_string(), messaging_health);

        let database_health = match database {
            Some(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => ServiceHealth::ok(),
                Err(e) => ServiceHealth::error(e.to_string()),
            },
            None if !self.config.database.enabled => ServiceHealth::disabled(),
            None => ServiceHealth::error("database is not connected"),
        };
        services.insert("database".to_string(), database_health);

        let cache_health = match cache {
            Some(mut connection) => {
                match redis::cmd("PING").query_async::<_, String>(&mut connection).await {
                    Ok(_) => ServiceHealth::ok(),
                    Err(e) => ServiceHealth::error(e.to_string()),
                }
            }
            None if !self.config.cache.enabled => ServiceHealth::disabled(),
            None => ServiceHealth::error("cache is not connected"),
        };
        services.insert("cache".to_string(), cache_health);

        let status = if services.values().any(ServiceHealth::is_error) {
            "degraded"
        } else {
            "ok"
        };

        HealthReport {
            status: status.to_string(),
            service: self.config.service.name.clone(),
            version: self.config.service.version.clone(),
            timestamp: Utc::now(),
            services,
            subscriptions,
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("service", &self.config.service.name)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

async fn connect_database(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime())
        .acquire_timeout(config.connect_timeout())
        .connect(&config.url())
        .await
        .map_err(|e| AppError::Database(format!("failed to connect to database: {}", e)))?;

    Ok(pool)
}

async fn connect_cache(config: &CacheConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.url())?;
    let mut connection = tokio::time::timeout(
        Duration::from_secs(5),
        ConnectionManager::new(client),
    )
    .await
    .map_err(|_| AppError::Cache("timed out connecting to cache".to_string()))??;

    redis::cmd("PING")
        .query_async::<_, String>(&mut connection)
        .await?;

    Ok(connection)
}
