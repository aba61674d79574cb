//! Tracks the state of background subscription tasks so failures show up in
//! health checks instead of only in logs.

use crate::messaging::config::BrokerKind;
use crate::messaging::metrics::MESSAGING_METRICS;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of one subscription task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    Starting,
    Running,
    /// Exited after cancellation
    Stopped,
    Failed { reason: String },
}

impl SubscriptionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Starting or running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Key of a supervised subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub broker: BrokerKind,
    pub topic: String,
}

impl SubscriptionKey {
    pub fn new(broker: BrokerKind, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.broker, self.topic)
    }
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub broker: BrokerKind,
    pub topic: String,
    #[serde(flatten)]
    pub state: SubscriptionState,
    pub updated_at: DateTime<Utc>,
}

/// Subscription supervisor
#[derive(Default)]
pub struct SubscriptionSupervisor {
    states: DashMap<SubscriptionKey, (SubscriptionState, DateTime<Utc>)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state transition and keep the active gauge in step
    pub fn mark(&self, key: &SubscriptionKey, state: SubscriptionState) {
        let previous = self
            .states
            .insert(key.clone(), (state.clone(), Utc::now()))
            .map(|(previous, _)| previous);

        let was_running = previous.as_ref().is_some_and(SubscriptionState::is_running);
        let gauge = MESSAGING_METRICS
            .active_subscriptions
            .with_label_values(&[key.broker.as_str()]);

        match (was_running, state.is_running()) {
            (false, true) => gauge.inc(),
            (true, false) => gauge.dec(),
            _ => {}
        }

        match &state {
            SubscriptionState::Failed { reason } => {
                warn!(subscription = %key, reason = %reason, "Subscription failed")
            }
            other => debug!(subscription = %key, state = ?other, "Subscription state changed"),
        }
    }

    /// Move `key` to `Starting` unless a task already owns it.
    ///
    /// Returns false when the subscription is starting or running.
    pub fn claim(&self, key: &SubscriptionKey) -> bool {
        match self.states.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().0.is_active() {
                    return false;
                }
                entry.insert((SubscriptionState::Starting, Utc::now()));
            }
            Entry::Vacant(entry) => {
                entry.insert((SubscriptionState::Starting, Utc::now()));
            }
        }

        debug!(subscription = %key, "Subscription claimed");
        true
    }

    pub fn state(&self, key: &SubscriptionKey) -> Option<SubscriptionState> {
        self.states.get(key).map(|entry| entry.value().0.clone())
    }

    /// All subscriptions, sorted by broker then topic
    pub fn snapshot(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<SubscriptionStatus> = self
            .states
            .iter()
            .map(|entry| SubscriptionStatus {
                broker: entry.key().broker,
                topic: entry.key().topic.clone(),
                state: entry.value().0.clone(),
                updated_at: entry.value().1,
            })
            .collect();

        statuses.sort_by(|a, b| {
            (a.broker.as_str(), a.topic.as_str()).cmp(&(b.broker.as_str(), b.topic.as_str()))
        });
        statuses
    }

    /// Human-readable description of every failed subscription
    pub fn failures(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|status| match status.state {
                SubscriptionState::Failed { reason } => Some(format!(
                    "subscription {}/{} failed: {}",
                    status.broker, status.topic, reason
                )),
                _ => None,
            })
            .collect()
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tasks not yet joined
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every tracked task, aborting those still running after `timeout`.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn join_all(&self, timeout: Duration) -> usize {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Subscription task ended abnormally"),
                Err(_elapsed) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            warn!(aborted, "Subscription tasks did not stop in time");
        }
        aborted
    }
}

impl std::fmt::Debug for SubscriptionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSupervisor")
            .field("subscriptions", &self.states.len())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_reported() {
        let supervisor = SubscriptionSupervisor::new();
        let events = SubscriptionKey::new(BrokerKind::Kafka, "user.events");
        let commands = SubscriptionKey::new(BrokerKind::Kafka, "user.commands");

        supervisor.mark(&events, SubscriptionState::Running);
        supervisor.mark(
            &commands,
            SubscriptionState::Failed {
                reason: "boom".to_string(),
            },
        );

        assert_eq!(supervisor.state(&events), Some(SubscriptionState::Running));
        assert_eq!(
            supervisor.failures(),
            vec!["subscription kafka/user.commands failed: boom".to_string()]
        );
    }

    #[test]
    fn test_claim_rejects_active_subscription() {
        let supervisor = SubscriptionSupervisor::new();
        let key = SubscriptionKey::new(BrokerKind::Kafka, "orders");

        assert!(supervisor.claim(&key));
        assert!(!supervisor.claim(&key));

        supervisor.mark(&key, SubscriptionState::Running);
        assert!(!supervisor.claim(&key));

        supervisor.mark(&key, SubscriptionState::Stopped);
        assert!(supervisor.claim(&key));
        assert_eq!(supervisor.state(&key), Some(SubscriptionState::Starting));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let supervisor = SubscriptionSupervisor::new();
        supervisor.mark(&SubscriptionKey::new(BrokerKind::Nats, "b"), SubscriptionState::Starting);
        supervisor.mark(&SubscriptionKey::new(BrokerKind::Kafka, "z"), SubscriptionState::Stopped);
        supervisor.mark(&SubscriptionKey::new(BrokerKind::Kafka, "a"), SubscriptionState::Running);

        let topics: Vec<String> = supervisor.snapshot().into_iter().map(|s| s.topic).collect();
        assert_eq!(topics, vec!["a", "z", "b"]);
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_value(SubscriptionState::Failed {
            reason: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "x");
    }

    #[tokio::test]
    async fn test_join_all_aborts_stuck_tasks() {
        let supervisor = SubscriptionSupervisor::new();
        supervisor.track(tokio::spawn(async {}));
        supervisor.track(tokio::spawn(std::future::pending::<()>()));

        let aborted = supervisor.join_all(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
        assert_eq!(supervisor.pending_tasks(), 0);
    }
}
