//! Runs the PL/pgSQL procedures against a live Postgres. Each test gets a
//! fresh database from `sqlx::test`; run with
//! `DATABASE_URL=postgres://... cargo test -p bilty-store -- --ignored`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use sqlx::PgPool;
use uuid::Uuid;

use bilty_core::repository::{ChangeFeed, ReservationStore, ReserveRequest};
use bilty_core::{GrSeries, ReservationError, ReservationEvent, ReservationStatus};
use bilty_store::{DbClient, PgChangeFeed, PgReservationStore};

async fn seeded(pool: &PgPool, end: u64) -> (Arc<PgReservationStore>, Uuid) {
    let branch = Uuid::new_v4();
    DbClient { pool: pool.clone() }
        .seed_series(&[GrSeries::new(branch, "KOL", 1, end).unwrap()])
        .await
        .unwrap();
    (Arc::new(PgReservationStore::new(pool.clone(), 10)), branch)
}

fn request(branch: Uuid, session: &str) -> ReserveRequest {
    ReserveRequest::new(branch, "KOL", session)
}

async fn status_of(pool: &PgPool, id: Uuid) -> String {
    sqlx::query_scalar("SELECT status FROM gr_reservations WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn force_lapse(pool: &PgPool, id: Uuid) {
    sqlx::query("UPDATE gr_reservations SET expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

async fn next_event(events: &mut BoxStream<'static, ReservationEvent>) -> ReservationEvent {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("notification in time")
        .expect("feed open")
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_reserves_get_distinct_numbers(pool: PgPool) {
    let (store, branch) = seeded(&pool, 1000).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.reserve_next(&request(branch, &format!("tab-{}", i))).await
        }));
    }

    let mut numbers = HashSet::new();
    for task in tasks {
        let grant = task.await.unwrap().unwrap();
        assert!(numbers.insert(grant.gr_number), "duplicate {}", grant.gr_no);
    }
    assert_eq!(numbers, (1..=20).collect());
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_range_is_contiguous_and_all_or_nothing(pool: PgPool) {
    let (store, branch) = seeded(&pool, 5).await;

    let grants = store.reserve_range(&request(branch, "tab-a"), 3).await.unwrap();
    let numbers: Vec<u64> = grants.iter().map(|g| g.gr_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(grants[0].gr_no, "KOL000001");

    let err = store.reserve_range(&request(branch, "tab-b"), 3).await.unwrap_err();
    assert!(matches!(err, ReservationError::Exhausted { .. }));

    // The failed range claimed nothing.
    let next = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
    assert_eq!(next.gr_number, 4);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_released_number_is_reused_and_release_is_idempotent(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

    let first = store.release(grant.reservation_id, "tab-a").await.unwrap();
    assert_eq!(first, Some(ReservationStatus::Released));
    let second = store.release(grant.reservation_id, "tab-a").await.unwrap();
    assert_eq!(second, Some(ReservationStatus::Released));
    assert_eq!(store.release(Uuid::new_v4(), "tab-a").await.unwrap(), None);

    let again = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
    assert_eq!(again.gr_no, grant.gr_no);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_completed_number_is_never_reissued(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

    store
        .complete(grant.reservation_id, "tab-a", "bilty-1")
        .await
        .unwrap();
    store
        .complete(grant.reservation_id, "tab-a", "bilty-1")
        .await
        .unwrap();
    let err = store
        .complete(grant.reservation_id, "tab-a", "bilty-2")
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::Conflict(_)));

    let status = store.release(grant.reservation_id, "tab-a").await.unwrap();
    assert_eq!(status, Some(ReservationStatus::Completed));

    let next = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
    assert_ne!(next.gr_no, grant.gr_no);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_late_heartbeat_expires_the_row(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

    let renewed = store.heartbeat(grant.reservation_id, "tab-a").await.unwrap();
    assert!(renewed >= grant.expires_at);

    force_lapse(&pool, grant.reservation_id).await;
    let err = store.heartbeat(grant.reservation_id, "tab-a").await.unwrap_err();
    assert_eq!(err, ReservationError::Expired(grant.reservation_id));
    assert_eq!(status_of(&pool, grant.reservation_id).await, "EXPIRED");

    let taken = store.reserve_next(&request(branch, "tab-b")).await.unwrap();
    assert_eq!(taken.gr_no, grant.gr_no);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_late_complete_expires_the_row(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

    force_lapse(&pool, grant.reservation_id).await;
    let err = store
        .complete(grant.reservation_id, "tab-a", "bilty-1")
        .await
        .unwrap_err();
    assert_eq!(err, ReservationError::Expired(grant.reservation_id));
    assert_eq!(status_of(&pool, grant.reservation_id).await, "EXPIRED");
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_error_codes_map_to_reservation_errors(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();

    let err = store.heartbeat(Uuid::new_v4(), "tab-a").await.unwrap_err();
    assert!(matches!(err, ReservationError::NotFound(_)));

    let err = store.heartbeat(grant.reservation_id, "tab-b").await.unwrap_err();
    assert!(matches!(err, ReservationError::Conflict(_)));

    let err = store.release(grant.reservation_id, "tab-b").await.unwrap_err();
    assert!(matches!(err, ReservationError::Conflict(_)));

    let err = store
        .reserve_next(&ReserveRequest::new(branch, "DEL", "tab-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::InvalidRequest(_)));

    let err = store.reserve_range(&request(branch, "tab-a"), 11).await.unwrap_err();
    assert!(matches!(err, ReservationError::InvalidRequest(_)));
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_sweep_expires_lapsed_holds(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let grants = store.reserve_range(&request(branch, "tab-a"), 2).await.unwrap();
    assert_eq!(store.sweep_expired().await.unwrap(), 0);

    force_lapse(&pool, grants[0].reservation_id).await;
    assert_eq!(store.sweep_expired().await.unwrap(), 1);

    let live = store.live_holds(branch).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, grants[1].reservation_id);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_notifications_decode_into_events(pool: PgPool) {
    let (store, branch) = seeded(&pool, 10).await;
    let (feed, _listener) = PgChangeFeed::start(&pool).await.unwrap();
    let mut events = feed.subscribe(branch);

    let grant = store.reserve_next(&request(branch, "tab-a")).await.unwrap();
    store.release(grant.reservation_id, "tab-a").await.unwrap();

    let held = next_event(&mut events).await;
    assert_eq!(held.reservation_id, grant.reservation_id);
    assert_eq!(held.status, ReservationStatus::Active);
    assert_eq!(held.gr_no, "KOL000001");
    assert_eq!(held.holder_session_id.expose(), "tab-a");

    let released = next_event(&mut events).await;
    assert_eq!(released.status, ReservationStatus::Released);
    assert!(released.occurred_at >= held.occurred_at);
}
