use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use bilty_shared::{ReservationEvent, ReservationStatus};

use crate::clock::{Clock, SystemClock};
use crate::live::branch_events;
use crate::repository::{ChangeFeed, ReservationStore, ReserveRequest};
use crate::reservation::{Grant, Reservation};
use crate::series::GrSeries;
use crate::{ReservationError, ReservationResult};

pub const DEFAULT_MAX_RANGE: u32 = 100;
const EVENT_CAPACITY: usize = 1024;

type SeriesKey = (Uuid, String);

#[derive(Default)]
struct Keyspace {
    series: HashMap<SeriesKey, GrSeries>,
    reservations: HashMap<Uuid, Reservation>,
    /// Numbers currently counting against each series (live or completed).
    claimed: HashMap<SeriesKey, BTreeMap<u64, Uuid>>,
}

impl Keyspace {
    fn unclaim(&mut self, reservation: &Reservation) {
        let key = (reservation.branch_id, reservation.series_prefix.clone());
        if let Some(claimed) = self.claimed.get_mut(&key) {
            if claimed.get(&reservation.gr_number) == Some(&reservation.id) {
                claimed.remove(&reservation.gr_number);
            }
        }
    }

    /// Flip one reservation to `Expired` if its TTL has run out.
    fn expire_if_lapsed(&mut self, id: Uuid, now: DateTime<Utc>, events: &mut Vec<ReservationEvent>) -> bool {
        let Some(reservation) = self.reservations.get_mut(&id) else {
            return false;
        };
        if !reservation.is_lapsed(now) {
            return false;
        }
        if reservation.transition(ReservationStatus::Expired, now).is_err() {
            return false;
        }
        events.push(reservation.to_event());
        let snapshot = reservation.clone();
        self.unclaim(&snapshot);
        true
    }

    fn expire_lapsed_in(&mut self, key: &SeriesKey, now: DateTime<Utc>, events: &mut Vec<ReservationEvent>) -> usize {
        let ids: Vec<Uuid> = self
            .claimed
            .get(key)
            .map(|claimed| claimed.values().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter(|id| self.expire_if_lapsed(*id, now, events))
            .count()
    }

    /// Lowest `n` such that `n..n+count` is free and inside the series.
    fn lowest_gap(&self, key: &SeriesKey, series: &GrSeries, count: u64) -> Option<u64> {
        let mut candidate = series.start;
        if let Some(claimed) = self.claimed.get(key) {
            for &number in claimed.range(series.start..).map(|(n, _)| n) {
                if candidate > series.end {
                    break;
                }
                if number >= candidate.checked_add(count)? {
                    break;
                }
                candidate = number + 1;
            }
        }
        let last = candidate.checked_add(count - 1)?;
        (last <= series.end).then_some(candidate)
    }
}

/// Process-local implementation of the reservation procedures.
///
/// A single mutex over the whole keyspace plays the role of the database
/// transaction: each procedure runs start to finish while holding it, so two
/// callers can never observe the same free number.
pub struct InMemoryReservationStore {
    keyspace: Mutex<Keyspace>,
    events: broadcast::Sender<ReservationEvent>,
    clock: Arc<dyn Clock>,
    max_range: u32,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            events,
            clock,
            max_range: DEFAULT_MAX_RANGE,
        }
    }

    pub fn with_max_range(mut self, max_range: u32) -> Self {
        self.max_range = max_range;
        self
    }

    /// Register (or replace) the numbering book for a branch.
    pub fn register_series(&self, series: GrSeries) -> ReservationResult<()> {
        series.validate()?;
        let key = (series.branch_id, series.prefix.clone());
        info!("Registered GR series {} for branch {}", series.prefix, series.branch_id);
        self.lock().series.insert(key, series);
        Ok(())
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.lock().reservations.get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, events: Vec<ReservationEvent>) {
        for event in events {
            debug!("Reservation {} -> {} ({})", event.gr_no, event.status, event.holder_session_id);
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn reserve_block(&self, req: &ReserveRequest, count: u32) -> ReservationResult<Vec<Grant>> {
        if count == 0 || count > self.max_range {
            return Err(ReservationError::InvalidRequest(format!(
                "range size must be between 1 and {}, got {}",
                self.max_range, count
            )));
        }
        if req.holder_session_id.is_empty() {
            return Err(ReservationError::InvalidRequest("holder session id is empty".into()));
        }

        let now = self.clock.now();
        let ttl = req.ttl();
        let key = (req.branch_id, req.series_prefix.clone());
        let mut events = Vec::new();

        let result = {
            let mut ks = self.lock();
            let series = ks.series.get(&key).cloned().ok_or_else(|| {
                ReservationError::InvalidRequest(format!(
                    "no GR series {} configured for branch {}",
                    req.series_prefix, req.branch_id
                ))
            })?;

            ks.expire_lapsed_in(&key, now, &mut events);

            match ks.lowest_gap(&key, &series, u64::from(count)) {
                None => Err(ReservationError::Exhausted {
                    branch_id: req.branch_id,
                    prefix: req.series_prefix.clone(),
                }),
                Some(first) => {
                    let mut grants = Vec::with_capacity(count as usize);
                    for number in first..first + u64::from(count) {
                        let reservation = new_reservation(&series, req, number, now, ttl);
                        grants.push(reservation.grant());
                        events.push(reservation.to_event());
                        ks.claimed
                            .entry(key.clone())
                            .or_default()
                            .insert(number, reservation.id);
                        ks.reservations.insert(reservation.id, reservation);
                    }
                    Ok(grants)
                }
            }
        };

        self.publish(events);
        if let Ok(grants) = &result {
            info!(
                "Reserved {} GR number(s) from {} for branch {} starting at {}",
                grants.len(),
                req.series_prefix,
                req.branch_id,
                grants.first().map(|g| g.gr_no.as_str()).unwrap_or_default()
            );
        }
        result
    }
}

fn new_reservation(series: &GrSeries, req: &ReserveRequest, number: u64, now: DateTime<Utc>, ttl: Duration) -> Reservation {
    Reservation {
        id: Uuid::new_v4(),
        branch_id: series.branch_id,
        series_prefix: series.prefix.clone(),
        gr_no: series.format(number),
        gr_number: number,
        holder_session_id: req.holder_session_id.clone().into(),
        status: ReservationStatus::Active,
        reserved_at: now,
        expires_at: now + ttl,
        updated_at: now,
        ttl_seconds: ttl.num_seconds(),
        saved_record_ref: None,
    }
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn reserve_next(&self, req: &ReserveRequest) -> ReservationResult<Grant> {
        let mut grants = self.reserve_block(req, 1)?;
        grants
            .pop()
            .ok_or_else(|| ReservationError::Transport("empty grant from keyspace".into()))
    }

    async fn reserve_range(&self, req: &ReserveRequest, count: u32) -> ReservationResult<Vec<Grant>> {
        self.reserve_block(req, count)
    }

    async fn heartbeat(&self, reservation_id: Uuid, holder_session_id: &str) -> ReservationResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = {
            let mut ks = self.lock();
            let reservation = ks
                .reservations
                .get(&reservation_id)
                .ok_or(ReservationError::NotFound(reservation_id))?;
            if !reservation.is_held_by(holder_session_id) {
                return Err(ReservationError::Conflict(reservation.gr_no.clone()));
            }

            if ks.expire_if_lapsed(reservation_id, now, &mut events) {
                Err(ReservationError::Expired(reservation_id))
            } else {
                match ks.reservations.get_mut(&reservation_id) {
                    Some(r) if r.status == ReservationStatus::Active => {
                        r.expires_at = now + Duration::seconds(r.ttl_seconds);
                        r.updated_at = now;
                        events.push(r.to_event());
                        Ok(r.expires_at)
                    }
                    _ => Err(ReservationError::Expired(reservation_id)),
                }
            }
        };

        self.publish(events);
        result
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
    ) -> ReservationResult<Option<ReservationStatus>> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let status = {
            let mut ks = self.lock();
            let Some(reservation) = ks.reservations.get(&reservation_id) else {
                return Ok(None);
            };
            if reservation.status.is_terminal() {
                return Ok(Some(reservation.status));
            }
            if !reservation.is_held_by(holder_session_id) {
                return Err(ReservationError::Conflict(reservation.gr_no.clone()));
            }

            if !ks.expire_if_lapsed(reservation_id, now, &mut events) {
                if let Some(r) = ks.reservations.get_mut(&reservation_id) {
                    r.transition(ReservationStatus::Released, now)?;
                    events.push(r.to_event());
                    let snapshot = r.clone();
                    ks.unclaim(&snapshot);
                    info!("Released GR {} for branch {}", snapshot.gr_no, snapshot.branch_id);
                }
            }
            ks.reservations.get(&reservation_id).map(|r| r.status)
        };

        self.publish(events);
        Ok(status)
    }

    async fn complete(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
        saved_record_ref: &str,
    ) -> ReservationResult<()> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = {
            let mut ks = self.lock();
            let reservation = ks
                .reservations
                .get(&reservation_id)
                .ok_or(ReservationError::NotFound(reservation_id))?;
            if !reservation.is_held_by(holder_session_id) {
                return Err(ReservationError::Conflict(reservation.gr_no.clone()));
            }

            let status = reservation.status;
            let already_saved_as = reservation.saved_record_ref.clone();
            let gr_no = reservation.gr_no.clone();

            match status {
                ReservationStatus::Completed => {
                    if already_saved_as.as_deref() == Some(saved_record_ref) {
                        Ok(())
                    } else {
                        Err(ReservationError::Conflict(gr_no))
                    }
                }
                ReservationStatus::Released | ReservationStatus::Expired => {
                    Err(ReservationError::Expired(reservation_id))
                }
                ReservationStatus::Active => {
                    if ks.expire_if_lapsed(reservation_id, now, &mut events) {
                        Err(ReservationError::Expired(reservation_id))
                    } else if let Some(r) = ks.reservations.get_mut(&reservation_id) {
                        r.transition(ReservationStatus::Completed, now)?;
                        r.saved_record_ref = Some(saved_record_ref.to_string());
                        events.push(r.to_event());
                        info!("Completed GR {} as record {}", r.gr_no, saved_record_ref);
                        Ok(())
                    } else {
                        Err(ReservationError::NotFound(reservation_id))
                    }
                }
            }
        };

        self.publish(events);
        result
    }

    async fn sweep_expired(&self) -> ReservationResult<usize> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let swept = {
            let mut ks = self.lock();
            let lapsed: Vec<Uuid> = ks
                .reservations
                .values()
                .filter(|r| r.is_lapsed(now))
                .map(|r| r.id)
                .collect();
            lapsed
                .into_iter()
                .filter(|id| ks.expire_if_lapsed(*id, now, &mut events))
                .count()
        };
        self.publish(events);
        Ok(swept)
    }

    async fn live_holds(&self, branch_id: Uuid) -> ReservationResult<Vec<Reservation>> {
        let now = self.clock.now();
        let ks = self.lock();
        let mut holds: Vec<Reservation> = ks
            .reservations
            .values()
            .filter(|r| r.branch_id == branch_id && r.is_live(now))
            .cloned()
            .collect();
        holds.sort_by(|a, b| {
            a.series_prefix
                .cmp(&b.series_prefix)
                .then(a.gr_number.cmp(&b.gr_number))
        });
        Ok(holds)
    }
}

impl ChangeFeed for InMemoryReservationStore {
    fn subscribe(&self, branch_id: Uuid) -> BoxStream<'static, ReservationEvent> {
        branch_events(self.events.subscribe(), branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures_util::StreamExt;
    use std::collections::HashSet;

    fn store_with_series(start: u64, end: u64) -> (Arc<InMemoryReservationStore>, Arc<ManualClock>, Uuid) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryReservationStore::with_clock(clock.clone()));
        let branch = Uuid::new_v4();
        store
            .register_series(GrSeries::new(branch, "KOL", start, end).unwrap())
            .unwrap();
        (store, clock, branch)
    }

    fn request(branch: Uuid, session: &str) -> ReserveRequest {
        ReserveRequest::new(branch, "KOL", session)
    }

    #[tokio::test]
    async fn test_concurrent_reserve_next_never_duplicates() {
        let (store, _clock, branch) = store_with_series(1, 1000);

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .reserve_next(&request(branch, &format!("tab-{}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let grant = handle.await.unwrap();
            assert!(seen.insert(grant.gr_no.clone()), "duplicate {}", grant.gr_no);
        }
        assert_eq!(seen.len(), 64);
        // Lowest numbers first, no gaps.
        assert!(seen.contains("KOL000001"));
        assert!(seen.contains("KOL000064"));
    }

    #[tokio::test]
    async fn test_range_is_contiguous_or_nothing() {
        let (store, _clock, branch) = store_with_series(1, 8);

        let block = store.reserve_range(&request(branch, "tab-a"), 5).await.unwrap();
        let numbers: Vec<u64> = block.iter().map(|g| g.gr_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

        // Only 3 left; a block of 5 must fail without claiming any of them.
        let err = store.reserve_range(&request(branch, "tab-b"), 5).await.unwrap_err();
        assert!(matches!(err, ReservationError::Exhausted { .. }));
        assert_eq!(store.live_holds(branch).await.unwrap().len(), 5);

        let rest = store.reserve_range(&request(branch, "tab-b"), 3).await.unwrap();
        assert_eq!(rest.first().unwrap().gr_no, "KOL000006");
    }

    #[tokio::test]
    async fn test_range_skips_gaps_that_are_too_small() {
        let (store, _clock, branch) = store_with_series(1, 100);
        let first = store.reserve_range(&request(branch, "tab-a"), 3).await.unwrap();
        store
            .release(first[1].reservation_id, "tab-a")
            .await
            .unwrap();

        let pair = store.reserve_range(&request(branch, "tab-b"), 2).await.unwrap();
        assert_eq!(pair[0].gr_number, 4);
        assert_eq!(pair[1].gr_number, 5);

        // The single hole is still the lowest free number.
        let single = store.reserve_next(&request(branch, "tab-c")).await.unwrap();
        assert_eq!(single.gr_number, 2);
    }

    #[tokio::test]
    async fn test_range_size_is_bounded() {
        let (store, _clock, branch) = store_with_series(1, 1000);
        let zero = store.reserve_range(&request(branch, "tab-a"), 0).await;
        assert!(matches!(zero, Err(ReservationError::InvalidRequest(_))));
        let huge = store
            .reserve_range(&request(branch, "tab-a"), DEFAULT_MAX_RANGE + 1)
            .await;
        assert!(matches!(huge, Err(ReservationError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_released_number_is_reservable_again() {
        let (store, _clock, branch) = store_with_series(1, 10);
        let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
        store.release(grant.reservation_id, "tab-a").await.unwrap();

        let again = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
        assert_eq!(again.gr_no, grant.gr_no);
        assert_ne!(again.reservation_id, grant.reservation_id);
    }

    #[tokio::test]
    async fn test_completed_number_is_never_reissued() {
        let (store, _clock, branch) = store_with_series(1, 3);
        let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
        store
            .complete(grant.reservation_id, "tab-a", "bilty-1")
            .await
            .unwrap();

        let mut issued = Vec::new();
        loop {
            match store.reserve_next(&request(branch, "tab-b")).await {
                Ok(g) => {
                    issued.push(g.gr_no.clone());
                    store.release(g.reservation_id, "tab-b").await.unwrap();
                    if issued.len() > 5 {
                        break;
                    }
                }
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        assert!(!issued.contains(&grant.gr_no));

        // Completing again with the same record is idempotent.
        store
            .complete(grant.reservation_id, "tab-a", "bilty-1")
            .await
            .unwrap();
        let other = store
            .complete(grant.reservation_id, "tab-a", "bilty-2")
            .await
            .unwrap_err();
        assert!(matches!(other, ReservationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_series_exhaustion() {
        let (store, _clock, branch) = store_with_series(1, 2);
        for session in ["a", "b"] {
            let g = store.reserve_next(&request(branch, session)).await.unwrap();
            store.complete(g.reservation_id, session, session).await.unwrap();
        }
        let err = store.reserve_next(&request(branch, "c")).await.unwrap_err();
        assert_eq!(err.code(), "EXHAUSTED");
    }

    #[tokio::test]
    async fn test_hold_without_heartbeat_expires() {
        let (store, clock, branch) = store_with_series(1, 10);
        let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

        clock.advance(Duration::seconds(181));

        let taken_over = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
        assert_eq!(taken_over.gr_no, grant.gr_no);
        assert_eq!(
            store.reservation(grant.reservation_id).unwrap().status,
            ReservationStatus::Expired
        );

        let err = store.heartbeat(grant.reservation_id, "tab-a").await.unwrap_err();
        assert_eq!(err, ReservationError::Expired(grant.reservation_id));
        let err = store
            .complete(grant.reservation_id, "tab-a", "bilty-9")
            .await
            .unwrap_err();
        assert_eq!(err, ReservationError::Expired(grant.reservation_id));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_hold() {
        let (store, clock, branch) = store_with_series(1, 10);
        let grant = store
            .reserve_next(&request(branch, "tab-a").with_ttl_seconds(60))
            .await
            .unwrap();

        clock.advance(Duration::seconds(45));
        let renewed = store.heartbeat(grant.reservation_id, "tab-a").await.unwrap();
        assert!(renewed > grant.expires_at);

        clock.advance(Duration::seconds(45));
        // Past the original expiry, but the heartbeat kept it alive.
        let next = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
        assert_ne!(next.gr_no, grant.gr_no);

        let wrong_holder = store.heartbeat(grant.reservation_id, "tab-b").await.unwrap_err();
        assert!(matches!(wrong_holder, ReservationError::Conflict(_)));
        let unknown = store.heartbeat(Uuid::new_v4(), "tab-a").await.unwrap_err();
        assert!(matches!(unknown, ReservationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, _clock, branch) = store_with_series(1, 10);
        let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

        let first = store.release(grant.reservation_id, "tab-a").await.unwrap();
        let after_first = store.reservation(grant.reservation_id).unwrap();
        let second = store.release(grant.reservation_id, "tab-a").await.unwrap();
        let after_second = store.reservation(grant.reservation_id).unwrap();

        assert_eq!(first, Some(ReservationStatus::Released));
        assert_eq!(second, Some(ReservationStatus::Released));
        assert_eq!(after_first.updated_at, after_second.updated_at);

        assert_eq!(store.release(Uuid::new_v4(), "tab-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_reports_the_status_it_left() {
        let (store, clock, branch) = store_with_series(1, 10);
        let done = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
        store
            .complete(done.reservation_id, "tab-a", "bilty-1")
            .await
            .unwrap();
        let status = store.release(done.reservation_id, "tab-a").await.unwrap();
        assert_eq!(status, Some(ReservationStatus::Completed));

        let lapsed = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
        clock.advance(Duration::minutes(4));
        let status = store.release(lapsed.reservation_id, "tab-a").await.unwrap();
        assert_eq!(status, Some(ReservationStatus::Expired));
    }

    #[tokio::test]
    async fn test_sweep_expires_lapsed_holds() {
        let (store, clock, branch) = store_with_series(1, 10);
        store.reserve_range(&request(branch, "tab-a"), 3).await.unwrap();
        assert_eq!(store.sweep_expired().await.unwrap(), 0);

        clock.advance(Duration::minutes(4));
        assert_eq!(store.sweep_expired().await.unwrap(), 3);
        assert!(store.live_holds(branch).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_feed_is_scoped_to_branch() {
        let (store, _clock, branch) = store_with_series(1, 10);
        let other_branch = Uuid::new_v4();
        store
            .register_series(GrSeries::new(other_branch, "KOL", 1, 10).unwrap())
            .unwrap();

        let mut feed = store.subscribe(branch);
        store.reserve_next(&request(other_branch, "tab-x")).await.unwrap();
        let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
        store.release(grant.reservation_id, "tab-a").await.unwrap();

        let first = feed.next().await.unwrap();
        assert_eq!(first.branch_id, branch);
        assert_eq!(first.status, ReservationStatus::Active);
        let second = feed.next().await.unwrap();
        assert_eq!(second.status, ReservationStatus::Released);
        assert_eq!(second.gr_no, grant.gr_no);
    }
}
