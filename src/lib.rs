pub mod broadcast;
pub mod config;
pub mod dataplane;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod netinfo;
pub mod quickcheck;
pub mod ratelimit;
pub mod results;
pub mod server;
pub mod stream;

use std::sync::Arc;

use broadcast::BroadcastHub;
use config::ServerConfig;
use ratelimit::RateLimiter;
use stream::StreamManager;

/// Shared application state available to every handler via
/// `State<Arc<AppState>>`.
pub struct AppState {
    pub config: ServerConfig,

    /// Admission, lifecycle, and retention for every session.
    pub manager: Arc<StreamManager>,

    /// Control-plane rate limiting, per IP and global.
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new());
        let manager = Arc::new(StreamManager::new(&config, hub));
        let limiter = RateLimiter::new(config.rate_limit_per_ip, config.global_rate_limit);
        Arc::new(Self {
            config,
            manager,
            limiter,
        })
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.manager.hub()
    }
}
