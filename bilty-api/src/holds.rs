use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Extension, Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use bilty_core::{Reservation, ReservationEvent};
use bilty_shared::Redacted;

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::middleware::auth::BranchClaims;
use crate::state::AppState;

pub const SSE_EVENT: &str = "reservation";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/branches/{branch_id}/holds", get(list_holds))
        .route("/v1/branches/{branch_id}/holds/stream", get(stream_holds))
}

/// `session_id` identifies the caller's own tab; every other holder is shown
/// masked.
#[derive(Debug, Default, Deserialize)]
pub struct HoldsQuery {
    pub session_id: Option<String>,
}

impl HoldsQuery {
    fn mask(&self, holder: &Redacted<String>) -> Redacted<String> {
        match &self.session_id {
            Some(own) if own == holder.expose() => holder.clone(),
            _ => Redacted(holder.to_string()),
        }
    }
}

async fn list_holds(
    State(state): State<AppState>,
    Extension(claims): Extension<BranchClaims>,
    Path(branch_id): Path<Uuid>,
    Query(query): Query<HoldsQuery>,
) -> Result<Json<Vec<Reservation>>, AppError> {
    claims.authorize_branch(branch_id)?;

    let result = state.store.live_holds(branch_id).await;
    state.metrics.observe("live_holds", &result);
    let holds = result?
        .into_iter()
        .map(|r| Reservation {
            holder_session_id: query.mask(&r.holder_session_id),
            ..r
        })
        .collect();
    Ok(Json(holds))
}

struct OpenStream(Arc<Metrics>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.stream_closed();
    }
}

async fn stream_holds(
    State(state): State<AppState>,
    Extension(claims): Extension<BranchClaims>,
    Path(branch_id): Path<Uuid>,
    Query(query): Query<HoldsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    claims.authorize_branch(branch_id)?;

    state.metrics.stream_opened();
    let open = OpenStream(state.metrics.clone());
    tracing::debug!("{} subscribed to live holds for branch {}", claims.sub, branch_id);

    let stream = state.feed.subscribe(branch_id).map(move |event| {
        let _open = &open;
        let event = ReservationEvent {
            holder_session_id: query.mask(&event.holder_session_id),
            ..event
        };
        let sse = match Event::default().event(SSE_EVENT).json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                tracing::error!("Failed to encode reservation event {}: {}", event.gr_no, e);
                Event::default().comment("dropped event")
            }
        };
        Ok::<_, Infallible>(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
