use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};

use crate::error::AppError;
use crate::state::AppState;
use crate::utils::jwt;

/// Authenticated receipt owner extracted from the `Authorization: Bearer <token>` header.
///
/// Tokens come from the external identity provider; the `sub` claim is the owner id.
pub struct AuthUser {
    pub owner_id: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::TokenMissing)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AppError::TokenInvalid)?;

        let state = AppState::from_ref(state);
        let auth = &state.config.auth;
        let claims = jwt::verify(token, &auth.jwt_secret, auth.issuer.as_deref())
            .map_err(|_| AppError::TokenInvalid)?;

        Ok(AuthUser {
            owner_id: claims.sub,
        })
    }
}
