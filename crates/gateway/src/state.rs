use std::sync::Arc;

use vs_domain::config::Config;
use vs_engine::Engine;
use vs_store::Store;

use crate::coordinator::Coordinator;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub engine: Arc<Engine>,
    pub coordinator: Arc<Coordinator>,
}
