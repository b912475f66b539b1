//! Registration, phone verification, login and password reset.
//!
//! New accounts start PENDING and become ACTIVE once the SMS code sent at
//! registration is confirmed. Only then is a session token issued.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{ApiError, ApiJson, ApiResult};
use super::middleware_auth::RequireAuth;
use super::AppState;
use crate::auth;
use crate::config::CODE_MAX_ATTEMPTS;
use crate::db::users::{NewUser, User, UserRole, UserStatus};
use crate::db::verification::{CodeCheck, CodePurpose};
use crate::sms;

const MAX_NAME_LEN: usize = 100;

#[derive(Deserialize)]
pub(super) struct RegisterPayload {
    phone: String,
    password: String,
    name: String,
    role: UserRole,
}

#[derive(Deserialize)]
pub(super) struct PhonePayload {
    phone: String,
}

#[derive(Deserialize)]
pub(super) struct VerifyPayload {
    phone: String,
    code: String,
}

#[derive(Deserialize)]
pub(super) struct LoginPayload {
    phone: String,
    password: String,
}

#[derive(Deserialize)]
pub(super) struct ResetPayload {
    phone: String,
    code: String,
    password: String,
}

pub(super) fn parse_phone(raw: &str) -> ApiResult<String> {
    auth::normalize_phone(raw).ok_or_else(|| ApiError::validation("Invalid phone number"))
}

pub(super) fn validate_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::validation("Name is too long (max 100 characters)"));
    }
    Ok(name.to_string())
}

/// Hash off the async runtime; argon2 is deliberately slow.
pub(super) async fn hash_password(password: String) -> ApiResult<String> {
    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(hash)
}

async fn verify_password(password: String, hash: String) -> ApiResult<bool> {
    let ok = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(ok)
}

fn session(state: &AppState, user: User) -> ApiResult<Json<serde_json::Value>> {
    let token = auth::issue_token(
        &state.config.jwt_secret,
        user.id,
        user.role,
        state.config.token_ttl,
    )?;
    Ok(Json(json!({ "token": token, "user": user })))
}

/// Issue a fresh code for `phone`, honouring the resend throttle.
async fn send_code(state: &AppState, phone: &str, purpose: CodePurpose) -> ApiResult<()> {
    if let Some(last) = state.db.latest_code_sent_at(phone, purpose).await? {
        let wait = (last + state.config.code_resend) - Utc::now();
        if wait.num_seconds() > 0 {
            return Err(ApiError::validation(format!(
                "Please wait {} seconds before requesting a new code",
                wait.num_seconds()
            )));
        }
    }
    let code = auth::generate_code();
    state
        .db
        .create_code(phone, purpose, &code, state.config.code_ttl)
        .await?;
    state
        .sms
        .send(phone, &sms::code_text(&code))
        .await
        .map_err(|e| {
            warn!(phone, error = %e, "failed to send verification code");
            ApiError::Upstream("Failed to send SMS".into())
        })
}

pub(super) async fn handler_register(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RegisterPayload>,
) -> ApiResult<impl IntoResponse> {
    let phone = parse_phone(&payload.phone)?;
    auth::validate_password(&payload.password).map_err(ApiError::Validation)?;
    let name = validate_name(&payload.name)?;
    if payload.role == UserRole::Admin {
        return Err(ApiError::validation("Role must be CUSTOMER or EXECUTOR"));
    }

    let password_hash = hash_password(payload.password).await?;
    let user = state
        .db
        .create_user(&NewUser {
            phone: &phone,
            password_hash: &password_hash,
            name: &name,
            role: payload.role,
            status: UserStatus::Pending,
            phone_verified: false,
            bonus_balance: state.config.welcome_bonus,
        })
        .await?
        .ok_or_else(|| ApiError::validation("User with this phone already exists"))?;
    info!(user_id = %user.id, role = %user.role, "user registered");

    // The account exists either way; the user can ask for another code.
    if let Err(e) = send_code(&state, &phone, CodePurpose::VerifyPhone).await {
        warn!(user_id = %user.id, error = %e, "verification code not delivered");
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user_id": user.id,
            "phone": user.phone,
            "message": "Verification code sent",
        })),
    ))
}

pub(super) async fn handler_verify_phone(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<VerifyPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let phone = parse_phone(&payload.phone)?;
    let user = state
        .db
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    if user.status != UserStatus::Pending {
        return Err(ApiError::validation("Phone number is already verified"));
    }
    let verdict = state
        .db
        .check_code(&phone, CodePurpose::VerifyPhone, &payload.code, CODE_MAX_ATTEMPTS)
        .await?;
    if verdict != CodeCheck::Valid {
        return Err(ApiError::validation(verdict.message()));
    }
    let user = state
        .db
        .activate_user(user.id)
        .await?
        .ok_or_else(|| ApiError::validation("Phone number is already verified"))?;
    info!(user_id = %user.id, "phone verified");
    session(&state, user)
}

pub(super) async fn handler_resend_code(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<PhonePayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let phone = parse_phone(&payload.phone)?;
    let user = state
        .db
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    if user.status != UserStatus::Pending {
        return Err(ApiError::validation("Phone number is already verified"));
    }
    send_code(&state, &phone, CodePurpose::VerifyPhone).await?;
    Ok(Json(json!({ "message": "Verification code sent" })))
}

pub(super) async fn handler_login(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<LoginPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let invalid = || ApiError::unauthorized("Invalid phone or password");
    let phone = auth::normalize_phone(&payload.phone).ok_or_else(invalid)?;
    let user = state
        .db
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(payload.password, user.password_hash.clone()).await? {
        return Err(invalid());
    }
    match user.status {
        UserStatus::Blocked => return Err(ApiError::forbidden("Account is blocked")),
        UserStatus::Pending => {
            return Err(ApiError::forbidden(
                "Phone number is not verified, confirm it with the SMS code",
            ))
        }
        UserStatus::Active => {}
    }
    session(&state, user)
}

pub(super) async fn handler_forgot_password(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<PhonePayload>,
) -> ApiResult<Json<serde_json::Value>> {
    // Same answer whether or not the phone is registered.
    if let Some(phone) = auth::normalize_phone(&payload.phone) {
        match state.db.get_user_by_phone(&phone).await? {
            Some(user) if user.status != UserStatus::Blocked => {
                if let Err(e) = send_code(&state, &phone, CodePurpose::ResetPassword).await {
                    warn!(user_id = %user.id, error = %e, "reset code not sent");
                }
            }
            _ => {}
        }
    }
    Ok(Json(json!({
        "message": "If this phone is registered, a reset code has been sent"
    })))
}

pub(super) async fn handler_reset_password(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ResetPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::validate_password(&payload.password).map_err(ApiError::Validation)?;
    let phone = parse_phone(&payload.phone)?;
    let user = state
        .db
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::validation(CodeCheck::Invalid.message()))?;
    let verdict = state
        .db
        .check_code(&phone, CodePurpose::ResetPassword, &payload.code, CODE_MAX_ATTEMPTS)
        .await?;
    if verdict != CodeCheck::Valid {
        return Err(ApiError::validation(verdict.message()));
    }
    let hash = hash_password(payload.password).await?;
    state.db.set_password(user.id, &hash).await?;
    info!(user_id = %user.id, "password reset");
    Ok(Json(json!({ "message": "Password updated" })))
}

pub(super) async fn handler_me(RequireAuth(user): RequireAuth) -> Json<User> {
    Json(user)
}
