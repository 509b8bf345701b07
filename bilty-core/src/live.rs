use chrono::{DateTime, Utc};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use bilty_shared::{ReservationEvent, ReservationStatus};

/// Narrow a broadcast of all reservation changes to one branch. A lagging
/// subscriber skips what it missed rather than ending the stream.
pub fn branch_events(
    rx: broadcast::Receiver<ReservationEvent>,
    branch_id: Uuid,
) -> BoxStream<'static, ReservationEvent> {
    BroadcastStream::new(rx)
        .filter_map(move |item| {
            let event = match item {
                Ok(event) if event.branch_id == branch_id => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Live hold subscriber for branch {} lagged, skipped {} events", branch_id, skipped);
                    None
                }
            };
            future::ready(event)
        })
        .boxed()
}

/// One row of the "GR X is being used by ..." panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHold {
    pub reservation_id: Uuid,
    pub branch_id: Uuid,
    pub gr_no: String,
    pub holder_session_id: String,
    pub expires_at: DateTime<Utc>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Latest {
    status: ReservationStatus,
    occurred_at: DateTime<Utc>,
    hold: Option<LiveHold>,
}

/// Folds the change feed into the current set of holds.
///
/// The feed is at-least-once and unordered, so `apply` keeps the newest
/// `(status, occurred_at)` per reservation and ignores anything it has already
/// seen or that is older. State is tracked per reservation rather than per GR
/// number: when a lapsed hold is taken over, its EXPIRED event and the new
/// holder's ACTIVE event carry the same timestamp.
#[derive(Debug, Default)]
pub struct LiveHoldBoard {
    latest: BTreeMap<String, HashMap<Uuid, Latest>>,
}

impl LiveHoldBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the board changed.
    pub fn apply(&mut self, event: &ReservationEvent) -> bool {
        let reservations = self.latest.entry(event.gr_no.clone()).or_default();

        if let Some(current) = reservations.get(&event.reservation_id) {
            if event.occurred_at < current.occurred_at {
                return false;
            }
            if event.occurred_at == current.occurred_at {
                // Same reservation, same instant: a terminal state beats an
                // active one, anything else is a duplicate.
                if current.status.is_terminal() || !event.status.is_terminal() {
                    return false;
                }
            }
        }

        let hold = (event.status == ReservationStatus::Active).then(|| LiveHold {
            reservation_id: event.reservation_id,
            branch_id: event.branch_id,
            gr_no: event.gr_no.clone(),
            holder_session_id: event.holder_session_id.expose().clone(),
            expires_at: event.expires_at,
            seen_at: event.occurred_at,
        });

        reservations.insert(
            event.reservation_id,
            Latest {
                status: event.status,
                occurred_at: event.occurred_at,
                hold,
            },
        );
        true
    }

    /// Holds still active as of `now`, ordered by GR number.
    pub fn holds(&self, now: DateTime<Utc>) -> Vec<&LiveHold> {
        self.latest
            .values()
            .filter_map(|reservations| current_hold(reservations, now))
            .collect()
    }

    pub fn holder_of(&self, gr_no: &str, now: DateTime<Utc>) -> Option<&LiveHold> {
        self.latest
            .get(gr_no)
            .and_then(|reservations| current_hold(reservations, now))
    }

    /// Drop bookkeeping for reservations whose last known state is terminal.
    pub fn compact(&mut self) {
        for reservations in self.latest.values_mut() {
            reservations.retain(|_, l| !l.status.is_terminal());
        }
        self.latest.retain(|_, reservations| !reservations.is_empty());
    }
}

/// The most recently seen unexpired hold on one number. Two live entries only
/// coexist while the older one's terminal event is still in flight.
fn current_hold(reservations: &HashMap<Uuid, Latest>, now: DateTime<Utc>) -> Option<&LiveHold> {
    reservations
        .values()
        .filter_map(|l| l.hold.as_ref())
        .filter(|h| now < h.expires_at)
        .max_by_key(|h| h.seen_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(id: Uuid, gr_no: &str, status: ReservationStatus, at: DateTime<Utc>) -> ReservationEvent {
        ReservationEvent {
            reservation_id: id,
            branch_id: Uuid::nil(),
            series_prefix: "KOL".into(),
            gr_no: gr_no.into(),
            status,
            holder_session_id: "tab-1".into(),
            expires_at: at + Duration::minutes(3),
            occurred_at: at,
        }
    }

    #[test]
    fn test_duplicates_and_stale_events_are_ignored() {
        let t0 = Utc::now();
        let id = Uuid::new_v4();
        let mut board = LiveHoldBoard::new();

        let held = event(id, "KOL000001", ReservationStatus::Active, t0);
        assert!(board.apply(&held));
        assert!(!board.apply(&held));
        assert_eq!(board.holds(t0).len(), 1);

        let released = event(id, "KOL000001", ReservationStatus::Released, t0 + Duration::seconds(5));
        assert!(board.apply(&released));
        // Late redelivery of the older ACTIVE event must not resurrect it.
        assert!(!board.apply(&held));
        assert!(board.holder_of("KOL000001", t0).is_none());
    }

    #[test]
    fn test_out_of_order_across_numbers() {
        let t0 = Utc::now();
        let mut board = LiveHoldBoard::new();
        board.apply(&event(Uuid::new_v4(), "KOL000002", ReservationStatus::Active, t0 + Duration::seconds(1)));
        board.apply(&event(Uuid::new_v4(), "KOL000001", ReservationStatus::Active, t0));

        let numbers: Vec<&str> = board.holds(t0 + Duration::seconds(2)).iter().map(|h| h.gr_no.as_str()).collect();
        assert_eq!(numbers, vec!["KOL000001", "KOL000002"]);

        // Holds past their expiry drop off even without an EXPIRED event.
        assert!(board.holds(t0 + Duration::minutes(10)).is_empty());
    }

    #[test]
    fn test_terminal_wins_on_timestamp_tie_and_compacts() {
        let t0 = Utc::now();
        let id = Uuid::new_v4();
        let mut board = LiveHoldBoard::new();
        board.apply(&event(id, "KOL000003", ReservationStatus::Active, t0));
        assert!(board.apply(&event(id, "KOL000003", ReservationStatus::Completed, t0)));
        assert!(!board.apply(&event(id, "KOL000003", ReservationStatus::Active, t0)));
        assert!(board.holds(t0).is_empty());

        board.compact();
        assert!(board.apply(&event(id, "KOL000003", ReservationStatus::Active, t0 - Duration::seconds(1))));
    }

    #[test]
    fn test_takeover_of_lapsed_number_shows_new_holder() {
        let t0 = Utc::now();
        let taken_at = t0 + Duration::seconds(181);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        for order in [[0, 1, 2], [0, 2, 1], [2, 1, 0], [1, 2, 0]] {
            let events = [
                event(first, "KOL000001", ReservationStatus::Active, t0),
                event(first, "KOL000001", ReservationStatus::Expired, taken_at),
                event(second, "KOL000001", ReservationStatus::Active, taken_at),
            ];
            let mut board = LiveHoldBoard::new();
            for i in order {
                board.apply(&events[i]);
            }

            let holder = board.holder_of("KOL000001", taken_at).map(|h| h.reservation_id);
            assert_eq!(holder, Some(second), "delivery order {:?}", order);
            assert_eq!(board.holds(taken_at).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_takeover_replayed_from_memory_store() {
        use crate::clock::{Clock, ManualClock};
        use crate::memory::InMemoryReservationStore;
        use crate::repository::{ChangeFeed, ReservationStore, ReserveRequest};
        use crate::series::GrSeries;
        use std::sync::Arc;

        let clock = Arc::new(ManualClock::default());
        let store = InMemoryReservationStore::with_clock(clock.clone());
        let branch = Uuid::new_v4();
        store
            .register_series(GrSeries::new(branch, "KOL", 1, 10).unwrap())
            .unwrap();
        let mut feed = store.subscribe(branch);

        store
            .reserve_next(&ReserveRequest::new(branch, "KOL", "tab-a"))
            .await
            .unwrap();
        clock.advance(Duration::seconds(181));
        let taken = store
            .reserve_next(&ReserveRequest::new(branch, "KOL", "tab-b"))
            .await
            .unwrap();

        let mut board = LiveHoldBoard::new();
        for _ in 0..3 {
            board.apply(&feed.next().await.unwrap());
        }

        let holder = board.holder_of("KOL000001", clock.now()).unwrap();
        assert_eq!(holder.reservation_id, taken.reservation_id);
        assert_eq!(holder.holder_session_id, "tab-b");
    }
}
