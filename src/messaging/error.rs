//! Error types for messaging operations

use crate::error::AppError;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// Connection to the broker could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish failed at the transport level
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Reader could not be created or attached to a topic
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Payload could not be serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Broker is administratively disabled
    #[error("{0} is disabled in configuration")]
    BrokerDisabled(String),

    /// Subscription was stopped through its cancellation token
    #[error("Subscription to '{0}' cancelled")]
    Cancelled(String),

    /// Health probe surfaced a non-timeout failure
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Resource could not be released
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// Several independent operations failed
    #[error("{context}: {}", .failures.join("; "))]
    Aggregate {
        context: String,
        failures: Vec<String>,
    },
}

impl MessagingError {
    /// Collapse a list of failures into one error, or `Ok` when empty
    pub fn aggregate(context: impl Into<String>, failures: Vec<String>) -> MessagingResult<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MessagingError::Aggregate {
                context: context.into(),
                failures,
            })
        }
    }

    /// Returns true for the clean-exit error of a subscribe loop
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MessagingError::Cancelled(_))
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::SerializationError(err.to_string())
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::ConfigurationError(msg) => AppError::Configuration(msg),
            MessagingError::BrokerDisabled(_) => AppError::Configuration(err.to_string()),
            _ => AppError::Messaging(err.to_string()),
        }
    }
}
