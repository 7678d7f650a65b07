//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::relay::Relay;
use crate::security::RequestLimiter;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub gateway: Arc<Gateway>,
    pub limiter: Option<Arc<RequestLimiter>>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let relay = Arc::new(Relay::new());
        let supervisor = Supervisor::new(config.runtime.clone(), config.staging_root.clone());
        let gateway = Arc::new(Gateway::new(relay.clone(), supervisor, config.time_limit));
        let limiter = config.rate_limit.map(|limit| Arc::new(RequestLimiter::new(limit)));
        Self {
            relay,
            gateway,
            limiter,
        }
    }
}
