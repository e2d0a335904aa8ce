use std::sync::Arc;

use escrowline_settlement::SettlementEngine;

use crate::auth::SessionResolver;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub sessions: Arc<dyn SessionResolver>,
}

impl AppState {
    pub fn new(engine: Arc<SettlementEngine>, sessions: Arc<dyn SessionResolver>) -> Self {
        Self { engine, sessions }
    }
}
