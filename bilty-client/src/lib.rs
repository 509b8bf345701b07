//! HTTP transport for the reservation coordinator.
//!
//! `HttpReservationStore` and `HttpChangeFeed` speak to a `bilty-api`
//! server, so a `ReservationCoordinator` built on them behaves the same as
//! one built on an in-process store.

pub mod feed;
pub mod store;

pub use feed::HttpChangeFeed;
pub use store::HttpReservationStore;
