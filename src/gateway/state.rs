use std::sync::Arc;

use crate::scoring::ScoringService;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct HandlerState {
    pub service: Arc<ScoringService>,
}

impl HandlerState {
    pub fn new(service: Arc<ScoringService>) -> Self {
        Self { service }
    }
}
