//! Application state shared across handlers.

use modproxy_core::config::AppConfig;
use modproxy_resolver::Engine;
use modproxy_storage::ObjectStore;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Resolution engine. Cheap to clone.
    pub engine: Engine,
}

impl AppState {
    /// Create a new application state.
    pub fn new(config: AppConfig, engine: Engine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// The object store the engine indexes into.
    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        self.engine.store()
    }

    /// Upper bound on the time spent producing a response.
    pub fn request_timeout(&self) -> Duration {
        self.config.server.request_timeout()
    }
}
