use std::sync::Arc;

use bilty_core::repository::{ChangeFeed, ReservationStore};
use bilty_store::app_config::ReservationRules;
use bilty_store::RedisClient;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReservationStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub redis: Option<Arc<RedisClient>>,
    pub auth: AuthConfig,
    pub rules: ReservationRules,
    pub rate_limit_per_minute: i64,
    pub metrics: Arc<Metrics>,
}
