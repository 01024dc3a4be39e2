use ml_retention::CacheEngine;
use std::sync::Arc;

/// Shared application state passed to all route handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CacheEngine>,
}
