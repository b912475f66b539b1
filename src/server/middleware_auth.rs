//! JWT auth extractors for API routes.
//!
//! Reads `Authorization: Bearer <token>`, verifies the HS256 signature, and
//! re-reads the user so that blocks and role changes apply immediately.
//!
//! - [`RequireAuth`]: any ACTIVE user
//! - [`RequireCustomer`] / [`RequireExecutor`]: ACTIVE user of that role
//! - [`RequireAdmin`]: ACTIVE admin

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::auth;
use crate::db::users::{User, UserRole, UserStatus};

/// Resolve a session token to an active user.
pub(crate) async fn authenticate(state: &AppState, token: &str) -> Result<User, ApiError> {
    let claims = auth::decode_token(&state.config.jwt_secret, token)
        .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;
    load_active_user(state, claims.sub).await
}

/// Re-read an account and require it to still be ACTIVE.
pub(crate) async fn load_active_user(state: &AppState, id: Uuid) -> Result<User, ApiError> {
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("User no longer exists"))?;
    match user.status {
        UserStatus::Active => Ok(user),
        UserStatus::Blocked => Err(ApiError::forbidden("Account is blocked")),
        UserStatus::Pending => Err(ApiError::forbidden("Phone number is not verified")),
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub struct RequireAuth(pub User);

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token =
            bearer_token(parts).ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        Ok(RequireAuth(authenticate(state, token).await?))
    }
}

async fn require_role(
    parts: &mut Parts,
    state: &Arc<AppState>,
    role: UserRole,
    message: &'static str,
) -> Result<User, ApiError> {
    let RequireAuth(user) = RequireAuth::from_request_parts(parts, state).await?;
    if user.role != role {
        return Err(ApiError::forbidden(message));
    }
    Ok(user)
}

pub struct RequireAdmin(pub User);

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        require_role(parts, state, UserRole::Admin, "Admin access required")
            .await
            .map(RequireAdmin)
    }
}

pub struct RequireCustomer(pub User);

impl FromRequestParts<Arc<AppState>> for RequireCustomer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        require_role(parts, state, UserRole::Customer, "Only customers can do this")
            .await
            .map(RequireCustomer)
    }
}

pub struct RequireExecutor(pub User);

impl FromRequestParts<Arc<AppState>> for RequireExecutor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        require_role(parts, state, UserRole::Executor, "Only executors can do this")
            .await
            .map(RequireExecutor)
    }
}
