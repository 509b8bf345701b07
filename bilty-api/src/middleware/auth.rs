use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const ROLE_BRANCH_USER: &str = "BRANCH_USER";
pub const ROLE_ADMIN: &str = "ADMIN";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BranchClaims {
    pub sub: String,
    pub branch_id: Uuid,
    pub role: String,
    pub exp: usize,
}

impl BranchClaims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Branch users only see their own branch's series and holds.
    pub fn authorize_branch(&self, branch_id: Uuid) -> Result<(), AppError> {
        if self.is_admin() || self.branch_id == branch_id {
            Ok(())
        } else {
            Err(AppError::AuthorizationError(format!(
                "Not allowed to act on branch {}",
                branch_id
            )))
        }
    }
}

pub async fn branch_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::AuthenticationError("Missing Authorization header".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::AuthenticationError("Expected a Bearer token".into()))?;

    let token_data = decode::<BranchClaims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::AuthenticationError(format!("Invalid token: {}", e)))?;

    if token_data.claims.role != ROLE_BRANCH_USER && token_data.claims.role != ROLE_ADMIN {
        return Err(AppError::AuthorizationError(format!(
            "Role {} may not reserve GR numbers",
            token_data.claims.role
        )));
    }

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}
