pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::container::Container;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub container: Arc<Container>,
}

impl AppState {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }
}
