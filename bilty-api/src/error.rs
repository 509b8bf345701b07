use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bilty_core::ReservationError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    Reservation(ReservationError),
    InternalServerError(String),
}

pub fn status_for(err: &ReservationError) -> StatusCode {
    match err {
        ReservationError::Conflict(_)
        | ReservationError::Exhausted { .. }
        | ReservationError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
        ReservationError::Expired(_) => StatusCode::GONE,
        ReservationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ReservationError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            AppError::Reservation(err) => {
                if let ReservationError::Transport(msg) = &err {
                    tracing::error!("Reservation backend unavailable: {}", msg);
                }
                (status_for(&err), err.code(), err.to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        Self::Reservation(err)
    }
}
