mod common;

use common::*;
use signal_copier::{
    config::AppConfig,
    container::{Container, ContainerState},
    messaging::SubscriptionState,
    AppError,
};
use std::sync::Arc;
use std::time::Duration;

/// Config with database and cache switched off and only Kafka enabled
fn offline_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.enabled = false;
    config.cache.enabled = false;
    config.messaging = kafka_only_config();
    config
}

fn offline_container() -> (Container, Arc<InMemoryConnector>) {
    let connector = Arc::new(InMemoryConnector::new());
    let container = Container::new(offline_config())
        .with_connector(connector.clone())
        .with_shutdown_grace(Duration::from_secs(2));
    (container, connector)
}

/// Full lifecycle: uninitialized, ready, closed
#[tokio::test]
async fn test_lifecycle() {
    let (container, connector) = offline_container();
    assert_eq!(container.state().await, ContainerState::Uninitialized);

    container.initialize().await.unwrap();
    assert_eq!(container.state().await, ContainerState::Ready);
    assert_eq!(connector.connect_count(), 1);

    let factory = container.messaging().await.unwrap();
    let running = wait_until(Duration::from_secs(2), || {
        factory
            .subscription_states()
            .iter()
            .filter(|status| status.state == SubscriptionState::Running)
            .count()
            == 2
    })
    .await;
    assert!(running);

    container.close().await.unwrap();
    assert_eq!(container.state().await, ContainerState::Closed);
    assert!(container.shutdown_token().is_cancelled());
    assert!(factory
        .subscription_states()
        .iter()
        .all(|status| status.state == SubscriptionState::Stopped));
}

/// A second initialize on a ready container is a no-op
#[tokio::test]
async fn test_initialize_twice() {
    let (container, connector) = offline_container();

    container.initialize().await.unwrap();
    container.initialize().await.unwrap();

    assert_eq!(connector.connect_count(), 1);
    container.close().await.unwrap();
}

/// A closed container cannot be initialized again; close stays idempotent
#[tokio::test]
async fn test_initialize_after_close() {
    let (container, _connector) = offline_container();
    container.initialize().await.unwrap();
    container.close().await.unwrap();

    let err = container.initialize().await.unwrap_err();
    assert!(matches!(err, AppError::Lifecycle(_)));
    assert!(container.close().await.is_ok());
}

/// Health report is ok with disabled dependencies and a healthy broker
#[tokio::test]
async fn test_health_report() {
    let (container, _connector) = offline_container();
    container.initialize().await.unwrap();

    let report = container.health().await;
    assert_eq!(report.status, "ok");
    assert_eq!(report.service, "copier");
    assert_eq!(report.services["database"].status, "disabled");
    assert_eq!(report.services["cache"].status, "disabled");
    assert_eq!(report.services["messaging"].status, "ok");
    assert_eq!(report.subscriptions.len(), 2);

    container.close().await.unwrap();
}

/// Unreachable broker degrades health but does not abort startup
#[tokio::test]
async fn test_unreachable_broker_degrades_health() {
    let mut connector = InMemoryConnector::new();
    connector.fail = true;
    let container = Container::new(offline_config()).with_connector(Arc::new(connector));

    container.initialize().await.unwrap();
    assert_eq!(container.state().await, ContainerState::Ready);

    let report = container.health().await;
    assert_eq!(report.status, "degraded");
    assert_eq!(report.services["messaging"].status, "error");

    container.close().await.unwrap();
}

/// An unreachable database aborts initialize; close still cleans up
#[tokio::test]
async fn test_database_failure_aborts_initialize() {
    let mut config = offline_config();
    config.database.enabled = true;
    config.database.host = "127.0.0.1".to_string();
    config.database.port = 1;
    config.database.connect_timeout_secs = 1;

    let container = Container::new(config).with_connector(Arc::new(InMemoryConnector::new()));

    let err = container.initialize().await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(container.state().await, ContainerState::Initializing);

    // Retrying without closing is refused
    assert!(matches!(
        container.initialize().await.unwrap_err(),
        AppError::Lifecycle(_)
    ));

    container.close().await.unwrap();
    assert_eq!(container.state().await, ContainerState::Closed);
}
