use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::AppState;
use super::error::ApiError;
use crate::directory::Authenticator;
use crate::error::TradeError;
use crate::types::UserId;

/// Caller resolved from the `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TradeError::Unauthorized("missing Authorization header".into()))?;

        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            TradeError::Unauthorized("expected Authorization: Bearer <token>".into())
        })?;

        let user_id = state.market.directory.authenticate(token.trim())?;
        Ok(AuthUser { user_id })
    }
}
