use axum::{
    extract::{Path, State},
    routing::post,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bilty_core::{Grant, ReservationStatus, ReserveRequest};

use crate::error::AppError;
use crate::middleware::auth::BranchClaims;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/branches/{branch_id}/series/{prefix}/reservations",
            post(reserve_next),
        )
        .route(
            "/v1/branches/{branch_id}/series/{prefix}/reservations/range",
            post(reserve_range),
        )
        .route("/v1/reservations/{id}/heartbeat", post(heartbeat))
        .route("/v1/reservations/{id}/release", post(release))
        .route("/v1/reservations/{id}/complete", post(complete))
}

#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    pub session_id: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReserveRangeBody {
    pub session_id: String,
    pub count: u32,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub session_id: String,
    pub saved_record_ref: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RangeResponse {
    pub grants: Vec<Grant>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub reservation_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub reservation_id: Uuid,
    /// `null` when the server has no such reservation.
    pub status: Option<ReservationStatus>,
}

fn reserve_request(state: &AppState, branch_id: Uuid, prefix: String, session_id: String, ttl_seconds: Option<i64>) -> Result<ReserveRequest, AppError> {
    if session_id.trim().is_empty() {
        return Err(bilty_core::ReservationError::InvalidRequest("session_id must not be empty".into()).into());
    }
    let ttl = ttl_seconds.unwrap_or(state.rules.default_ttl_seconds);
    Ok(ReserveRequest::new(branch_id, prefix, session_id).with_ttl_seconds(ttl))
}

async fn reserve_next(
    State(state): State<AppState>,
    Extension(claims): Extension<BranchClaims>,
    Path((branch_id, prefix)): Path<(Uuid, String)>,
    Json(body): Json<ReserveBody>,
) -> Result<Json<Grant>, AppError> {
    claims.authorize_branch(branch_id)?;
    let req = reserve_request(&state, branch_id, prefix, body.session_id, body.ttl_seconds)?;

    let result = state.store.reserve_next(&req).await;
    state.metrics.observe("reserve_next", &result);
    let grant = result?;

    tracing::info!("{} reserved {} for branch {}", claims.sub, grant.gr_no, branch_id);
    Ok(Json(grant))
}

async fn reserve_range(
    State(state): State<AppState>,
    Extension(claims): Extension<BranchClaims>,
    Path((branch_id, prefix)): Path<(Uuid, String)>,
    Json(body): Json<ReserveRangeBody>,
) -> Result<Json<RangeResponse>, AppError> {
    claims.authorize_branch(branch_id)?;
    let req = reserve_request(&state, branch_id, prefix, body.session_id, body.ttl_seconds)?;

    let result = state.store.reserve_range(&req, body.count).await;
    state.metrics.observe("reserve_range", &result);
    let grants = result?;

    tracing::info!("{} reserved {} GR numbers for branch {}", claims.sub, grants.len(), branch_id);
    Ok(Json(RangeResponse { grants }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SessionBody>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let result = state.store.heartbeat(id, &body.session_id).await;
    state.metrics.observe("heartbeat", &result);
    Ok(Json(HeartbeatResponse {
        reservation_id: id,
        expires_at: result?,
    }))
}

async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SessionBody>,
) -> Result<Json<AckResponse>, AppError> {
    let result = state.store.release(id, &body.session_id).await;
    state.metrics.observe("release", &result);
    Ok(Json(AckResponse {
        reservation_id: id,
        status: result?,
    }))
}

async fn complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<AckResponse>, AppError> {
    let result = state
        .store
        .complete(id, &body.session_id, &body.saved_record_ref)
        .await;
    state.metrics.observe("complete", &result);
    result?;
    Ok(Json(AckResponse {
        reservation_id: id,
        status: Some(ReservationStatus::Completed),
    }))
}
