//! Shared state handed to every handler.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use super::proxy::ProxyDispatcher;
use crate::analytics::Analytics;
use crate::antibot::AntiBotEngine;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::identity::IdentifierResolver;
use crate::ratelimit::{RateLimiter, RequestQueue};
use crate::rules::RuleStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub rules: Arc<RuleStore>,
    pub limiter: Arc<RateLimiter>,
    pub resolver: Arc<IdentifierResolver>,
    pub antibot: Arc<AntiBotEngine>,
    pub analytics: Arc<Analytics>,
    pub proxy: Arc<ProxyDispatcher>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let proxy = ProxyDispatcher::new(&config.upstream)?;
        let queue = Arc::new(RequestQueue::new());

        Ok(Self {
            rules: Arc::new(RuleStore::new()),
            limiter: Arc::new(RateLimiter::new(queue)),
            resolver: Arc::new(IdentifierResolver::new()),
            antibot: Arc::new(AntiBotEngine::new(&config.antibot)),
            analytics: Arc::new(Analytics::new(config.analytics.traffic_log_capacity)),
            proxy: Arc::new(proxy),
            config: Arc::new(config),
        })
    }

    /// Evict expired counters, tokens and idle queues.
    pub fn sweep(&self) {
        let counters = self.limiter.sweep(Instant::now(), &self.rules.snapshot());
        let tokens = self.antibot.sweep(crate::antibot::now_millis());
        let queues = self.limiter.queue().sweep();
        debug!(counters, tokens, queues, "Sweep finished");
    }
}
