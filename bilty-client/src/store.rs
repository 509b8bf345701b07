use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use bilty_core::repository::{ReservationStore, ReserveRequest};
use bilty_core::{Grant, Reservation, ReservationError, ReservationResult, ReservationStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct RangeBody {
    grants: Vec<Grant>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AckBody {
    status: Option<ReservationStatus>,
}

/// What the caller was doing, so a wire error can be turned back into the
/// matching `ReservationError`.
#[derive(Default)]
struct Context<'a> {
    reservation_id: Option<Uuid>,
    request: Option<&'a ReserveRequest>,
}

pub struct HttpReservationStore {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpReservationStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ReservationResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ReservationError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B, R>(&self, builder: reqwest::RequestBuilder, body: Option<&B>, ctx: Context<'_>) -> ReservationResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut builder = builder.bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ReservationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| ReservationError::Transport(format!("undecodable response: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        Err(decode_error(status, &text, &ctx))
    }
}

fn decode_error(status: StatusCode, text: &str, ctx: &Context<'_>) -> ReservationError {
    let body = serde_json::from_str::<ErrorBody>(text).ok();
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let reservation_id = ctx.reservation_id.unwrap_or_default();

    match body.as_ref().map(|b| b.code.as_str()) {
        Some("CONFLICT") | Some("INVALID_TRANSITION") => ReservationError::Conflict(message),
        Some("EXHAUSTED") => match ctx.request {
            Some(req) => ReservationError::Exhausted {
                branch_id: req.branch_id,
                prefix: req.series_prefix.clone(),
            },
            None => ReservationError::Conflict(message),
        },
        Some("NOT_FOUND") => ReservationError::NotFound(reservation_id),
        Some("EXPIRED") => ReservationError::Expired(reservation_id),
        Some("INVALID_REQUEST") => ReservationError::InvalidRequest(message),
        _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            warn!("Reservation API answered {}: {}", status, message);
            ReservationError::Transport(message)
        }
        _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            ReservationError::InvalidRequest(format!("not authorized ({})", status))
        }
        _ => ReservationError::Transport(message),
    }
}

#[async_trait]
impl ReservationStore for HttpReservationStore {
    async fn reserve_next(&self, req: &ReserveRequest) -> ReservationResult<Grant> {
        let path = format!(
            "/v1/branches/{}/series/{}/reservations",
            req.branch_id, req.series_prefix
        );
        let body = json!({
            "session_id": req.holder_session_id,
            "ttl_seconds": req.ttl().num_seconds(),
        });
        let grant: Grant = self
            .send(
                self.client.post(self.url(&path)),
                Some(&body),
                Context {
                    request: Some(req),
                    ..Context::default()
                },
            )
            .await?;
        debug!("Server granted {}", grant.gr_no);
        Ok(grant)
    }

    async fn reserve_range(&self, req: &ReserveRequest, count: u32) -> ReservationResult<Vec<Grant>> {
        let path = format!(
            "/v1/branches/{}/series/{}/reservations/range",
            req.branch_id, req.series_prefix
        );
        let body = json!({
            "session_id": req.holder_session_id,
            "count": count,
            "ttl_seconds": req.ttl().num_seconds(),
        });
        let range: RangeBody = self
            .send(
                self.client.post(self.url(&path)),
                Some(&body),
                Context {
                    request: Some(req),
                    ..Context::default()
                },
            )
            .await?;
        Ok(range.grants)
    }

    async fn heartbeat(&self, reservation_id: Uuid, holder_session_id: &str) -> ReservationResult<DateTime<Utc>> {
        let path = format!("/v1/reservations/{}/heartbeat", reservation_id);
        let body = json!({ "session_id": holder_session_id });
        let beat: HeartbeatBody = self
            .send(
                self.client.post(self.url(&path)),
                Some(&body),
                Context {
                    reservation_id: Some(reservation_id),
                    ..Context::default()
                },
            )
            .await?;
        Ok(beat.expires_at)
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
    ) -> ReservationResult<Option<ReservationStatus>> {
        let path = format!("/v1/reservations/{}/release", reservation_id);
        let body = json!({ "session_id": holder_session_id });
        let ack: AckBody = self
            .send(
                self.client.post(self.url(&path)),
                Some(&body),
                Context {
                    reservation_id: Some(reservation_id),
                    ..Context::default()
                },
            )
            .await?;
        Ok(ack.status)
    }

    async fn complete(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
        saved_record_ref: &str,
    ) -> ReservationResult<()> {
        let path = format!("/v1/reservations/{}/complete", reservation_id);
        let body = json!({
            "session_id": holder_session_id,
            "saved_record_ref": saved_record_ref,
        });
        let _: serde_json::Value = self
            .send(
                self.client.post(self.url(&path)),
                Some(&body),
                Context {
                    reservation_id: Some(reservation_id),
                    ..Context::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Expiry is the server's job; a remote caller has nothing to sweep.
    async fn sweep_expired(&self) -> ReservationResult<usize> {
        Ok(0)
    }

    async fn live_holds(&self, branch_id: Uuid) -> ReservationResult<Vec<Reservation>> {
        let path = format!("/v1/branches/{}/holds", branch_id);
        self.send::<(), _>(self.client.get(self.url(&path)), None, Context::default())
            .await
    }
}
