//! Shared application state passed to the dispatcher and control plane.

use std::sync::Arc;

use crate::config::Config;
use crate::registry::Registry;

/// Everything a request needs to resolve a hostname to a tunnel and talk to
/// the control plane, bundled once at startup.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Registry::new(config.max_sockets);
        Arc::new(Self { config, registry })
    }
}
