use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::redact::Redacted;

/// Lifecycle of a GR number hold.
///
/// `Active` is the only non-terminal state. `Completed` permanently consumes
/// the number; `Released` and `Expired` hand it back to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Expired,
    Released,
    Completed,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Active, ReservationStatus::Released)
                | (ReservationStatus::Active, ReservationStatus::Expired)
                | (ReservationStatus::Active, ReservationStatus::Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Released => "RELEASED",
            ReservationStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(ReservationStatus::Active),
            "EXPIRED" => Some(ReservationStatus::Expired),
            "RELEASED" => Some(ReservationStatus::Released),
            "COMPLETED" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change-feed payload. Emitted on every insert or status change of a
/// reservation; delivery is at-least-once and unordered across GR numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub reservation_id: Uuid,
    pub branch_id: Uuid,
    pub series_prefix: String,
    pub gr_no: String,
    pub status: ReservationStatus,
    pub holder_session_id: Redacted<String>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}
