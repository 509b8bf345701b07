use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bilty_shared::{Redacted, ReservationEvent, ReservationStatus};

use crate::{ReservationError, ReservationResult};

/// Temporary claim on one GR number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub series_prefix: String,
    pub gr_no: String,
    pub gr_number: u64,
    pub holder_session_id: Redacted<String>,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Hold length granted at reserve time; every heartbeat renews by this much.
    pub ttl_seconds: i64,
    pub saved_record_ref: Option<String>,
}

impl Reservation {
    /// Still holding the number at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && now < self.expires_at
    }

    /// `Active` on paper but past its TTL; the next writer flips it to `Expired`.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && now >= self.expires_at
    }

    /// Counts against the series: either live or permanently consumed.
    pub fn claims_number(&self, now: DateTime<Utc>) -> bool {
        self.is_live(now) || self.status == ReservationStatus::Completed
    }

    pub fn is_held_by(&self, session_id: &str) -> bool {
        self.holder_session_id.expose() == session_id
    }

    pub fn transition(&mut self, to: ReservationStatus, now: DateTime<Utc>) -> ReservationResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(ReservationError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn grant(&self) -> Grant {
        Grant {
            reservation_id: self.id,
            gr_no: self.gr_no.clone(),
            gr_number: self.gr_number,
            expires_at: self.expires_at,
        }
    }

    pub fn to_event(&self) -> ReservationEvent {
        ReservationEvent {
            reservation_id: self.id,
            branch_id: self.branch_id,
            series_prefix: self.series_prefix.clone(),
            gr_no: self.gr_no.clone(),
            status: self.status,
            holder_session_id: self.holder_session_id.clone(),
            expires_at: self.expires_at,
            occurred_at: self.updated_at,
        }
    }
}

/// What a successful reserve call hands back to the holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub reservation_id: Uuid,
    pub gr_no: String,
    pub gr_number: u64,
    pub expires_at: DateTime<Utc>,
}
