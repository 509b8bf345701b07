use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bilty_shared::{ReservationEvent, ReservationStatus};

use crate::reservation::{Grant, Reservation};
use crate::ReservationResult;

pub const DEFAULT_TTL_SECONDS: i64 = 180;
pub const MIN_TTL_SECONDS: i64 = 30;
pub const MAX_TTL_SECONDS: i64 = 900;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub branch_id: Uuid,
    pub series_prefix: String,
    pub holder_session_id: String,
    /// Requested hold length in seconds; clamped to the allowed window.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

impl ReserveRequest {
    pub fn new(branch_id: Uuid, series_prefix: impl Into<String>, holder_session_id: impl Into<String>) -> Self {
        Self {
            branch_id,
            series_prefix: series_prefix.into(),
            holder_session_id: holder_session_id.into(),
            ttl_seconds: None,
        }
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn ttl(&self) -> Duration {
        clamp_ttl(self.ttl_seconds)
    }
}

pub fn clamp_ttl(ttl_seconds: Option<i64>) -> Duration {
    let secs = ttl_seconds
        .unwrap_or(DEFAULT_TTL_SECONDS)
        .clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS);
    Duration::seconds(secs)
}

/// The atomic procedures of the GR keyspace. Every implementation must make
/// each call a single serializable step: callers never read-then-write.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn reserve_next(&self, req: &ReserveRequest) -> ReservationResult<Grant>;

    /// All-or-nothing block of `count` consecutive numbers.
    async fn reserve_range(&self, req: &ReserveRequest, count: u32) -> ReservationResult<Vec<Grant>>;

    async fn heartbeat(&self, reservation_id: Uuid, holder_session_id: &str) -> ReservationResult<DateTime<Utc>>;

    /// Idempotent; terminal or unknown reservations are a no-op. Returns the
    /// status the reservation ends up in, `None` if it does not exist.
    async fn release(&self, reservation_id: Uuid, holder_session_id: &str)
        -> ReservationResult<Option<ReservationStatus>>;

    async fn complete(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
        saved_record_ref: &str,
    ) -> ReservationResult<()>;

    /// Flip every lapsed `ACTIVE` hold to `EXPIRED`. Returns how many moved.
    async fn sweep_expired(&self) -> ReservationResult<usize>;

    async fn live_holds(&self, branch_id: Uuid) -> ReservationResult<Vec<Reservation>>;
}

/// Realtime reservation changes for one branch. The stream never ends on its
/// own; drop it and subscribe again to restart.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, branch_id: Uuid) -> BoxStream<'static, ReservationEvent>;
}
