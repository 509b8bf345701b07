pub mod models;
pub mod redact;

pub use models::events::{ReservationEvent, ReservationStatus};
pub use redact::Redacted;
