use std::sync::Arc;
use std::time::Duration;

use bilty_core::repository::ReservationStore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::metrics::Metrics;

/// Flip lapsed ACTIVE holds to EXPIRED so live-hold views catch up even when
/// nobody reserves from that series for a while.
pub async fn start_sweep_worker(store: Arc<dyn ReservationStore>, metrics: Arc<Metrics>, every: Duration) {
    info!("Expiry sweeper started, running every {:?}", every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match store.sweep_expired().await {
            Ok(0) => debug!("Sweep found no lapsed holds"),
            Ok(count) => {
                info!("Expired {} lapsed GR hold(s)", count);
                metrics.record_swept(count);
            }
            Err(e) => error!("Expiry sweep failed: {}", e),
        }
    }
}
