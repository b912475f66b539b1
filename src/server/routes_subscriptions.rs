//! Tariff listing and subscription purchase from the account balance.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::error::{ApiError, ApiJson, ApiResult};
use super::middleware_auth::{RequireAuth, RequireExecutor};
use super::AppState;
use crate::db::users::{PurchaseOutcome, TariffType};
use crate::notify::drafts;

#[derive(Deserialize)]
pub(super) struct PurchasePayload {
    tariff: TariffType,
}

pub(super) async fn handler_tariffs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "tariffs": state.config.tariffs.views() }))
}

pub(super) async fn handler_my_subscription(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
) -> Json<serde_json::Value> {
    let tariffs = &state.config.tariffs;
    let tariff = user.effective_tariff(Utc::now());
    Json(json!({
        "tariff": tariff,
        "expires_at": user.subscription_expires_at,
        "response_cost": tariffs.response_cost(tariff),
        "max_specializations": tariffs.specialization_limit(tariff),
        "specializations": user.specializations,
    }))
}

pub(super) async fn handler_purchase(
    State(state): State<Arc<AppState>>,
    RequireExecutor(user): RequireExecutor,
    ApiJson(payload): ApiJson<PurchasePayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let tariffs = &state.config.tariffs;
    if !tariffs.is_purchasable(payload.tariff) {
        return Err(ApiError::validation(format!(
            "Tariff {} cannot be purchased",
            payload.tariff
        )));
    }
    let outcome = state
        .db
        .purchase_subscription(user.id, payload.tariff, tariffs)
        .await?;
    match outcome {
        PurchaseOutcome::Activated { user, charge } => {
            info!(user_id = %user.id, tariff = %payload.tariff, paid = charge.total(), "subscription purchased");
            state
                .notifier
                .notify(
                    user.id,
                    drafts::subscription_activated(user.tariff, user.subscription_expires_at),
                )
                .await;
            Ok(Json(json!({
                "user": user,
                "charged": charge.total(),
                "from_bonus": charge.from_bonus,
                "from_balance": charge.from_balance,
            })))
        }
        PurchaseOutcome::InsufficientFunds {
            required,
            available,
        } => Err(ApiError::validation(format!(
            "Insufficient funds: tariff costs {}, available {}",
            required, available
        ))),
        PurchaseOutcome::UserNotFound => Err(ApiError::not_found("User not found")),
    }
}
