use futures_util::stream::BoxStream;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use bilty_core::live::branch_events;
use bilty_core::repository::ChangeFeed;
use bilty_shared::ReservationEvent;

pub const NOTIFY_CHANNEL: &str = "gr_reservations";
const EVENT_CAPACITY: usize = 1024;

/// Fans Postgres `NOTIFY gr_reservations` payloads out to in-process
/// subscribers. `PgListener` reconnects by itself; notifications sent while
/// it is down are lost, which subscribers tolerate by re-listing holds.
#[derive(Clone)]
pub struct PgChangeFeed {
    tx: broadcast::Sender<ReservationEvent>,
}

impl PgChangeFeed {
    pub async fn start(pool: &PgPool) -> Result<(Self, JoinHandle<()>), sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        info!("Listening for reservation changes on {}", NOTIFY_CHANNEL);

        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let forward = tx.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ReservationEvent>(notification.payload()) {
                            Ok(event) => {
                                // No subscribers is fine.
                                let _ = forward.send(event);
                            }
                            Err(e) => warn!("Dropping malformed reservation notification: {}", e),
                        }
                    }
                    Err(e) => {
                        error!("Change feed listener error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((Self { tx }, task))
    }

    /// Feed driven by the caller instead of Postgres.
    pub fn detached() -> (Self, broadcast::Sender<ReservationEvent>) {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        (Self { tx: tx.clone() }, tx)
    }
}

impl ChangeFeed for PgChangeFeed {
    fn subscribe(&self, branch_id: Uuid) -> BoxStream<'static, ReservationEvent> {
        branch_events(self.tx.subscribe(), branch_id)
    }
}
