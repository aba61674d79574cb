//! Signal copier backend core
//!
//! Configuration, lifecycle and the asynchronous messaging layer that moves
//! user events, commands and queries over Kafka or NATS JetStream.

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod messaging;
pub mod telemetry;

pub use config::AppConfig;
pub use container::{Container, ContainerState, HealthReport};
pub use error::{AppError, Result};
