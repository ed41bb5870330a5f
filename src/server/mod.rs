pub mod control;
pub mod ingress;

use std::{sync::Arc, time::SystemTime};

use rand::RngCore;
use service::{counters::Counters, registry::ClientRegistry};

use crate::{alias::AliasResolver, config::Config, ratelimit::RateLimiter};

/// Everything the control-channel server and the ingress dispatcher share.
pub struct SharedState {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub counters: Arc<Counters>,
    pub alias: AliasResolver,
    pub rate_limiter: RateLimiter,
    pub run_id: String,
    pub started_at: SystemTime,
}

impl SharedState {
    pub fn new(config: Arc<Config>) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit_requests,
            std::time::Duration::from_secs(60),
        );
        let alias = AliasResolver::new(&config);

        Self {
            registry: Arc::new(ClientRegistry::default()),
            counters: Arc::new(Counters::default()),
            run_id: generate_run_id(),
            started_at: SystemTime::now(),
            alias,
            rate_limiter,
            config,
        }
    }
}

fn generate_run_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
