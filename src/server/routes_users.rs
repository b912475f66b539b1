//! Own profile, password, specializations, balance and public profiles.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiResult};
use super::middleware_auth::{RequireAuth, RequireExecutor};
use super::routes_auth::{hash_password, validate_name};
use super::AppState;
use crate::auth;
use crate::db::orders::Category;
use crate::db::users::{ProfileUpdate, User};
use crate::db::Pagination;

const MAX_ABOUT_LEN: usize = 2000;

#[derive(Deserialize)]
pub(super) struct PasswordPayload {
    current_password: String,
    new_password: String,
}

#[derive(Deserialize)]
pub(super) struct SpecializationsPayload {
    specializations: Vec<Category>,
}

pub(super) async fn handler_profile_get(RequireAuth(user): RequireAuth) -> Json<User> {
    Json(user)
}

fn clean_profile(mut update: ProfileUpdate) -> ApiResult<ProfileUpdate> {
    if let Some(name) = &update.name {
        update.name = Some(validate_name(name)?);
    }
    if let Some(email) = update.email.as_deref().map(str::trim) {
        if !email.is_empty() && (!email.contains('@') || email.len() > 254) {
            return Err(ApiError::validation("Invalid email address"));
        }
        update.email = Some(email.to_string());
    }
    if let Some(about) = &update.about {
        if about.chars().count() > MAX_ABOUT_LEN {
            return Err(ApiError::validation("About is too long (max 2000 characters)"));
        }
    }
    update.region = update.region.map(|r| r.trim().to_string());
    Ok(update)
}

pub(super) async fn handler_profile_update(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiJson(update): ApiJson<ProfileUpdate>,
) -> ApiResult<Json<User>> {
    let update = clean_profile(update)?;
    let user = state
        .db
        .update_profile(user.id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user))
}

pub(super) async fn handler_change_password(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiJson(payload): ApiJson<PasswordPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let current = payload.current_password;
    let hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || auth::verify_password(&current, &hash))
        .await
        .map_err(anyhow::Error::from)?;
    if !matches {
        return Err(ApiError::validation("Current password is incorrect"));
    }
    auth::validate_password(&payload.new_password).map_err(ApiError::Validation)?;
    let hash = hash_password(payload.new_password).await?;
    state.db.set_password(user.id, &hash).await?;
    Ok(Json(json!({ "message": "Password updated" })))
}

/// Drop duplicates, keeping first-seen order.
fn dedup_categories(specs: Vec<Category>) -> Vec<Category> {
    let mut out = Vec::with_capacity(specs.len());
    for c in specs {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

pub(super) async fn handler_specializations(
    State(state): State<Arc<AppState>>,
    RequireExecutor(user): RequireExecutor,
    ApiJson(payload): ApiJson<SpecializationsPayload>,
) -> ApiResult<Json<User>> {
    let specs = dedup_categories(payload.specializations);
    let tariff = user.effective_tariff(Utc::now());
    let limit = state.config.tariffs.specialization_limit(tariff);
    if specs.len() > limit {
        return Err(ApiError::validation(format!(
            "Tariff {} allows at most {} specialization(s)",
            tariff, limit
        )));
    }
    let user = state
        .db
        .set_specializations(user.id, &specs)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user))
}

pub(super) async fn handler_balance(RequireAuth(user): RequireAuth) -> Json<serde_json::Value> {
    Json(json!({
        "balance": user.balance,
        "bonus_balance": user.bonus_balance,
        "tariff": user.tariff,
        "subscription_expires_at": user.subscription_expires_at,
    }))
}

pub(super) async fn handler_public_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let profile = state
        .db
        .get_public_profile(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let (reviews, total) = state
        .db
        .list_reviews_about(id, Pagination::new(1, 20))
        .await?;
    Ok(Json(json!({
        "user": profile,
        "reviews": reviews,
        "reviews_total": total,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        use Category::*;
        assert_eq!(
            dedup_categories(vec![Doors, Windows, Doors, Blinds, Windows]),
            vec![Doors, Windows, Blinds]
        );
    }

    #[test]
    fn profile_email_must_look_like_email() {
        let update = ProfileUpdate {
            email: Some("not-an-email".into()),
            ..Default::default()
        };
        assert!(clean_profile(update).is_err());

        let update = ProfileUpdate {
            email: Some("  master@example.ru ".into()),
            name: Some("  Пётр ".into()),
            ..Default::default()
        };
        let cleaned = clean_profile(update).unwrap();
        assert_eq!(cleaned.email.as_deref(), Some("master@example.ru"));
        assert_eq!(cleaned.name.as_deref(), Some("Пётр"));
    }

    #[test]
    fn blank_name_rejected() {
        let update = ProfileUpdate {
            name: Some("   ".into()),
            ..Default::default()
        };
        assert!(clean_profile(update).is_err());
    }
}
