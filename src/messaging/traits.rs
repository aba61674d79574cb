//! Messaging trait abstractions
//!
//! `BrokerClient` owns the locking, polling and shutdown policy; the broker
//! specific code only implements these seams.

use crate::messaging::error::MessagingResult;
use crate::messaging::message::BrokerMessage;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a failed read attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// Nothing arrived within the reader's wait window. Not a fault.
    #[error("no message available")]
    Timeout,

    /// Anything else reported by the transport
    #[error("{0}")]
    Transport(String),
}

impl ReadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadError::Timeout)
    }
}

/// Per-topic consumer resource
#[async_trait]
pub trait MessageReader: Send + Sync {
    /// Topic this reader is attached to
    fn topic(&self) -> &str;

    /// Blocking read bounded by the reader's own wait window
    async fn read(&self) -> Result<BrokerMessage, ReadError>;

    /// Bounded liveness probe used by health checks.
    ///
    /// Must not consume messages. A timeout is reported as `ReadError::Timeout`.
    async fn probe(&self, timeout: Duration) -> Result<(), ReadError>;

    /// Acknowledge the message last returned by [`MessageReader::read`].
    ///
    /// Called once the handler has returned, whatever its result. A message
    /// that is never acknowledged is redelivered by the broker.
    async fn ack(&self) -> MessagingResult<()> {
        Ok(())
    }

    /// Release the reader
    async fn close(&self) -> MessagingResult<()>;
}

/// Producer resource shared by all topics
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Write one message and wait for the configured acknowledgement
    async fn write(&self, message: &BrokerMessage) -> MessagingResult<()>;

    /// Flush and release the writer
    async fn close(&self) -> MessagingResult<()>;
}

/// Creates readers on demand
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    async fn create_reader(&self, topic: &str) -> MessagingResult<Arc<dyn MessageReader>>;
}

/// Callback invoked once per received message, sequentially per topic.
///
/// An error is logged by the subscribe loop; the message still counts as processed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = move |msg: BrokerMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(msg.key == "ok", "unexpected key {}", msg.key);
                Ok(())
            }
        };

        assert!(handler.handle(BrokerMessage::new("t", "ok", Vec::new())).await.is_ok());
        assert!(handler.handle(BrokerMessage::new("t", "bad", Vec::new())).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_error_classification() {
        assert!(ReadError::Timeout.is_timeout());
        assert!(!ReadError::Transport("connection reset".to_string()).is_timeout());
    }
}
