use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bilty_shared::{ReservationEvent, ReservationStatus};

use crate::repository::{clamp_ttl, ChangeFeed, ReservationStore, ReserveRequest};
use crate::reservation::Grant;
use crate::retry::RetryPolicy;
use crate::{ReservationError, ReservationResult};

/// How a session keeps its holds alive.
#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    /// Consecutive transport failures before a hold is reported at risk.
    pub max_failures: u32,
    pub retry: RetryPolicy,
    /// Silently grab a new number when the server says the hold is gone.
    pub auto_rereserve: bool,
    pub ttl_seconds: Option<i64>,
}

/// A third of the TTL the server will actually grant.
fn renewal_interval(ttl_seconds: Option<i64>) -> Duration {
    let ttl = clamp_ttl(ttl_seconds).num_seconds().max(3);
    Duration::from_secs((ttl / 3) as u64)
}

impl HeartbeatPolicy {
    /// Renew three times per TTL window.
    pub fn for_ttl(ttl_seconds: i64) -> Self {
        Self {
            interval: renewal_interval(Some(ttl_seconds)),
            ttl_seconds: Some(ttl_seconds),
            ..Self::default()
        }
    }

    /// Intervals that would let the hold lapse between renewals fall back to
    /// a third of the TTL.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        let ttl = clamp_ttl(self.ttl_seconds).num_seconds() as u64;
        self.interval = if interval.as_secs() >= ttl {
            renewal_interval(self.ttl_seconds)
        } else {
            interval
        };
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_auto_rereserve(mut self, enabled: bool) -> Self {
        self.auto_rereserve = enabled;
        self
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: renewal_interval(None),
            max_failures: 3,
            retry: RetryPolicy::default(),
            auto_rereserve: true,
            ttl_seconds: None,
        }
    }
}

/// What the form showing a GR number should display.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldState {
    Held {
        grant: Grant,
    },
    /// Heartbeats are failing on the network. The server may still hold the
    /// number until `grant.expires_at`; nothing is failed locally.
    AtRisk {
        grant: Grant,
        consecutive_failures: u32,
    },
    /// The old hold died and a fresh number was reserved in its place.
    Reassigned {
        previous_gr_no: String,
        grant: Grant,
    },
    Lost {
        reservation_id: Uuid,
        gr_no: String,
        reason: String,
    },
    Completed {
        grant: Grant,
    },
    Released {
        gr_no: String,
    },
}

impl HoldState {
    /// The grant currently held, if any.
    pub fn grant(&self) -> Option<&Grant> {
        match self {
            HoldState::Held { grant }
            | HoldState::AtRisk { grant, .. }
            | HoldState::Reassigned { grant, .. } => Some(grant),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            HoldState::Lost { .. } | HoldState::Completed { .. } | HoldState::Released { .. }
        )
    }
}

/// Client-side session object for GR number holds.
///
/// Every mutation goes through one of the store's atomic procedures; the
/// coordinator never decides locally which number is free.
#[derive(Clone)]
pub struct ReservationCoordinator {
    store: Arc<dyn ReservationStore>,
    feed: Arc<dyn ChangeFeed>,
    session_id: String,
    policy: HeartbeatPolicy,
}

impl ReservationCoordinator {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        feed: Arc<dyn ChangeFeed>,
        session_id: impl Into<String>,
        policy: HeartbeatPolicy,
    ) -> Self {
        Self {
            store,
            feed,
            session_id: session_id.into(),
            policy,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    fn request(&self, branch_id: Uuid, series_prefix: &str) -> ReserveRequest {
        ReserveRequest {
            branch_id,
            series_prefix: series_prefix.to_string(),
            holder_session_id: self.session_id.clone(),
            ttl_seconds: self.policy.ttl_seconds,
        }
    }

    pub async fn reserve_next(&self, branch_id: Uuid, series_prefix: &str) -> ReservationResult<Grant> {
        let req = self.request(branch_id, series_prefix);
        self.policy
            .retry
            .run("reserve_next", || self.store.reserve_next(&req))
            .await
    }

    pub async fn reserve_range(&self, branch_id: Uuid, series_prefix: &str, count: u32) -> ReservationResult<Vec<Grant>> {
        let req = self.request(branch_id, series_prefix);
        self.policy
            .retry
            .run("reserve_range", || self.store.reserve_range(&req, count))
            .await
    }

    pub async fn heartbeat(&self, reservation_id: Uuid) -> ReservationResult<DateTime<Utc>> {
        self.policy
            .retry
            .run("heartbeat", || self.store.heartbeat(reservation_id, &self.session_id))
            .await
    }

    /// Resulting status, or `None` if the server has no such reservation.
    pub async fn release(&self, reservation_id: Uuid) -> ReservationResult<Option<ReservationStatus>> {
        self.policy
            .retry
            .run("release", || self.store.release(reservation_id, &self.session_id))
            .await
    }

    /// Fire-and-forget release for teardown paths. If it never reaches the
    /// server the TTL reclaims the number.
    pub fn release_in_background(&self, reservation_id: Uuid) {
        spawn_release(self.store.clone(), self.session_id.clone(), reservation_id);
    }

    pub async fn complete(&self, reservation_id: Uuid, saved_record_ref: &str) -> ReservationResult<()> {
        self.policy
            .retry
            .run("complete", || {
                self.store
                    .complete(reservation_id, &self.session_id, saved_record_ref)
            })
            .await
    }

    pub fn subscribe_live_holds(&self, branch_id: Uuid) -> BoxStream<'static, ReservationEvent> {
        self.feed.subscribe(branch_id)
    }

    /// Reserve the next number and keep it alive until completed, released or
    /// dropped.
    pub async fn reserve_and_hold(&self, branch_id: Uuid, series_prefix: &str) -> ReservationResult<HoldHandle> {
        let grant = self.reserve_next(branch_id, series_prefix).await?;
        Ok(self.hold(branch_id, series_prefix, grant))
    }

    /// Start heartbeating an existing grant.
    pub fn hold(&self, branch_id: Uuid, series_prefix: &str, grant: Grant) -> HoldHandle {
        let (tx, rx) = watch::channel(HoldState::Held { grant });
        let mut handle = HoldHandle {
            store: self.store.clone(),
            req: self.request(branch_id, series_prefix),
            policy: self.policy.clone(),
            state: Arc::new(tx),
            rx,
            task: None,
            settled: false,
            complete_pending: false,
        };
        handle.start_heartbeats();
        handle
    }
}

/// Replace the state unless the hold already finished.
fn publish(tx: &watch::Sender<HoldState>, next: HoldState) -> bool {
    tx.send_if_modified(|state| {
        if state.is_finished() {
            return false;
        }
        *state = next;
        true
    })
}

fn current_grant(tx: &watch::Sender<HoldState>) -> Option<Grant> {
    tx.borrow().grant().cloned()
}

async fn heartbeat_loop(
    store: Arc<dyn ReservationStore>,
    req: ReserveRequest,
    policy: HeartbeatPolicy,
    tx: Arc<watch::Sender<HoldState>>,
) {
    let mut failures: u32 = 0;

    loop {
        let wait = if failures == 0 {
            policy.interval
        } else {
            policy.retry.delay_for(failures - 1).min(policy.interval)
        };
        tokio::time::sleep(wait).await;

        let Some(mut grant) = current_grant(&tx) else {
            return;
        };

        match store
            .heartbeat(grant.reservation_id, &req.holder_session_id)
            .await
        {
            Ok(expires_at) => {
                debug!("Renewed GR {} until {}", grant.gr_no, expires_at);
                failures = 0;
                grant.expires_at = expires_at;
                if !publish(&tx, HoldState::Held { grant }) {
                    return;
                }
            }
            Err(err) if err.is_retryable() => {
                failures += 1;
                if failures >= policy.max_failures {
                    warn!(
                        "GR {} at risk: {} consecutive heartbeat failures ({})",
                        grant.gr_no, failures, err
                    );
                    let at_risk = HoldState::AtRisk {
                        grant,
                        consecutive_failures: failures,
                    };
                    if !publish(&tx, at_risk) {
                        return;
                    }
                }
            }
            Err(err) if err.is_dead_hold() && policy.auto_rereserve => {
                info!("GR {} hold ended ({}), reserving a replacement", grant.gr_no, err);
                match policy
                    .retry
                    .run("re-reserve", || store.reserve_next(&req))
                    .await
                {
                    Ok(replacement) => {
                        info!("GR {} replaced by {}", grant.gr_no, replacement.gr_no);
                        failures = 0;
                        let reassigned = HoldState::Reassigned {
                            previous_gr_no: grant.gr_no,
                            grant: replacement.clone(),
                        };
                        if !publish(&tx, reassigned) {
                            // Finished while we were reserving; hand the new number back.
                            let _ = store
                                .release(replacement.reservation_id, &req.holder_session_id)
                                .await;
                            return;
                        }
                    }
                    Err(reserve_err) => {
                        warn!("Could not replace GR {}: {}", grant.gr_no, reserve_err);
                        publish(
                            &tx,
                            HoldState::Lost {
                                reservation_id: grant.reservation_id,
                                gr_no: grant.gr_no,
                                reason: reserve_err.to_string(),
                            },
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                warn!("Lost GR {}: {}", grant.gr_no, err);
                publish(
                    &tx,
                    HoldState::Lost {
                        reservation_id: grant.reservation_id,
                        gr_no: grant.gr_no,
                        reason: err.to_string(),
                    },
                );
                return;
            }
        }
    }
}

fn spawn_release(store: Arc<dyn ReservationStore>, session_id: String, reservation_id: Uuid) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = store.release(reservation_id, &session_id).await {
                    warn!("Background release of {} failed: {}", reservation_id, err);
                }
            });
        }
        Err(_) => {
            warn!("No runtime to release {}; leaving it to expire", reservation_id);
        }
    }
}

/// A live hold on one GR number with its heartbeat task.
///
/// Dropping the handle without calling [`HoldHandle::complete`] or
/// [`HoldHandle::release`] stops the heartbeats and fires a best-effort
/// release. A hold whose completion failed in transit is never released on
/// drop; the server either recorded the completion or lets the TTL lapse.
pub struct HoldHandle {
    store: Arc<dyn ReservationStore>,
    req: ReserveRequest,
    policy: HeartbeatPolicy,
    state: Arc<watch::Sender<HoldState>>,
    rx: watch::Receiver<HoldState>,
    task: Option<JoinHandle<()>>,
    settled: bool,
    complete_pending: bool,
}

impl HoldHandle {
    pub fn state(&self) -> HoldState {
        self.rx.borrow().clone()
    }

    pub fn grant(&self) -> Option<Grant> {
        self.rx.borrow().grant().cloned()
    }

    /// Watch channel for UI bindings.
    pub fn subscribe(&self) -> watch::Receiver<HoldState> {
        self.rx.clone()
    }

    /// Wait for the next state change. `None` once the hold is finished and
    /// nothing else will change.
    pub async fn changed(&mut self) -> Option<HoldState> {
        if self.rx.borrow().is_finished() {
            return None;
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    fn start_heartbeats(&mut self) {
        self.stop_heartbeats();
        self.task = Some(tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.req.clone(),
            self.policy.clone(),
            self.state.clone(),
        )));
    }

    fn stop_heartbeats(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn held_grant(&self) -> ReservationResult<Grant> {
        match &*self.state.borrow() {
            HoldState::Lost { reservation_id, .. } => Err(ReservationError::Expired(*reservation_id)),
            state => state
                .grant()
                .cloned()
                .ok_or_else(|| ReservationError::InvalidRequest("hold already finished".into())),
        }
    }

    /// Mark the number as used by a saved bilty.
    ///
    /// On a transport failure the hold stays alive and heartbeating, so the
    /// call can simply be repeated with the same `saved_record_ref`.
    pub async fn complete(&mut self, saved_record_ref: &str) -> ReservationResult<Grant> {
        let grant = self.held_grant()?;
        // A heartbeat racing the completion would see a finished hold and
        // reserve a replacement.
        self.stop_heartbeats();
        self.complete_pending = true;

        let session_id = self.req.holder_session_id.clone();
        let result = self
            .policy
            .retry
            .run("complete", || {
                self.store
                    .complete(grant.reservation_id, &session_id, saved_record_ref)
            })
            .await;

        match result {
            Ok(()) => {
                self.settled = true;
                self.complete_pending = false;
                self.state.send_replace(HoldState::Completed {
                    grant: grant.clone(),
                });
                Ok(grant)
            }
            Err(err) if err.is_dead_hold() => {
                self.settled = true;
                self.complete_pending = false;
                self.state.send_replace(HoldState::Lost {
                    reservation_id: grant.reservation_id,
                    gr_no: grant.gr_no.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
            Err(err) => {
                warn!("Completing GR {} failed, keeping the hold: {}", grant.gr_no, err);
                self.start_heartbeats();
                Err(err)
            }
        }
    }

    /// Give the number back, e.g. when the user cancels the form.
    pub async fn release(mut self) -> ReservationResult<()> {
        self.stop_heartbeats();
        let Ok(grant) = self.held_grant() else {
            self.settled = true;
            return Ok(());
        };

        let session_id = self.req.holder_session_id.clone();
        let result = self
            .policy
            .retry
            .run("release", || self.store.release(grant.reservation_id, &session_id))
            .await;

        // Either way the TTL is the fallback; the handle is done.
        self.settled = true;
        self.state.send_replace(HoldState::Released {
            gr_no: grant.gr_no.clone(),
        });
        result.map(|_| ())
    }
}

impl Drop for HoldHandle {
    fn drop(&mut self) {
        self.stop_heartbeats();
        if self.settled {
            return;
        }
        if self.complete_pending {
            if let Some(grant) = current_grant(&self.state) {
                warn!("Hold on {} dropped with completion unconfirmed, leaving it to the server", grant.gr_no);
            }
            return;
        }
        if let Some(grant) = current_grant(&self.state) {
            debug!("Hold on {} dropped, releasing in background", grant.gr_no);
            spawn_release(
                self.store.clone(),
                self.req.holder_session_id.clone(),
                grant.reservation_id,
            );
            self.state.send_replace(HoldState::Released { gr_no: grant.gr_no });
        }
    }
}
