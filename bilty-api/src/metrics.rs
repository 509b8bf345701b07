use axum::{extract::State, http::header, response::IntoResponse};
use bilty_core::ReservationResult;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    swept: IntCounter,
    live_streams: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("bilty".into()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("reservation_requests_total", "Reservation operations by outcome"),
            &["op", "outcome"],
        )?;
        let swept = IntCounter::new("reservations_swept_total", "Holds moved to EXPIRED by the sweeper")?;
        let live_streams = IntGauge::new("live_hold_streams", "Open live-hold SSE streams")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(swept.clone()))?;
        registry.register(Box::new(live_streams.clone()))?;

        Ok(Self {
            registry,
            requests,
            swept,
            live_streams,
        })
    }

    /// Count one operation; errors are labelled with their wire code.
    pub fn observe<T>(&self, op: &str, result: &ReservationResult<T>) {
        let outcome = match result {
            Ok(_) => "OK",
            Err(err) => err.code(),
        };
        self.requests.with_label_values(&[op, outcome]).inc();
    }

    pub fn record_swept(&self, count: usize) {
        self.swept.inc_by(count as u64);
    }

    pub fn stream_opened(&self) {
        self.live_streams.inc();
    }

    pub fn stream_closed(&self) {
        self.live_streams.dec();
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
