pub mod clock;
pub mod coordinator;
pub mod live;
pub mod memory;
pub mod repository;
pub mod reservation;
pub mod retry;
pub mod series;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{HeartbeatPolicy, HoldHandle, HoldState, ReservationCoordinator};
pub use live::{branch_events, LiveHold, LiveHoldBoard};
pub use memory::InMemoryReservationStore;
pub use repository::{ChangeFeed, ReservationStore, ReserveRequest};
pub use reservation::{Grant, Reservation};
pub use retry::RetryPolicy;
pub use series::GrSeries;

pub use bilty_shared::{ReservationEvent, ReservationStatus};

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("GR number already held: {0}")]
    Conflict(String),
    #[error("No GR numbers left in series {prefix} for branch {branch_id}")]
    Exhausted { branch_id: Uuid, prefix: String },
    #[error("Reservation not found: {0}")]
    NotFound(Uuid),
    #[error("Reservation expired: {0}")]
    Expired(Uuid),
    #[error("Reservation backend unreachable: {0}")]
    Transport(String),
    #[error("Invalid reservation request: {0}")]
    InvalidRequest(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
}

impl ReservationError {
    /// Stable code used on the wire and in metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            ReservationError::Conflict(_) => "CONFLICT",
            ReservationError::Exhausted { .. } => "EXHAUSTED",
            ReservationError::NotFound(_) => "NOT_FOUND",
            ReservationError::Expired(_) => "EXPIRED",
            ReservationError::Transport(_) => "TRANSPORT",
            ReservationError::InvalidRequest(_) => "INVALID_REQUEST",
            ReservationError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ReservationError::Transport(_))
    }

    /// The hold is gone and the caller has to reserve again.
    pub fn is_dead_hold(&self) -> bool {
        matches!(
            self,
            ReservationError::Expired(_) | ReservationError::NotFound(_)
        )
    }
}

pub type ReservationResult<T> = Result<T, ReservationError>;
