//! Payment creation through the gateway and the signed gateway webhook.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiQuery, ApiResult};
use super::middleware_auth::RequireAuth;
use super::{AppState, Page};
use crate::config::Config;
use crate::db::payments::{CompletionOutcome, Payment, PaymentPurpose, PaymentStatus};
use crate::db::users::TariffType;
use crate::db::Pagination;
use crate::notify::drafts;
use crate::payments::{self, CallbackPayload, GatewayPaymentRequest, SIGNATURE_HEADER};

#[derive(Deserialize)]
pub(super) struct CreatePayload {
    purpose: PaymentPurpose,
    amount: Option<i64>,
    tariff: Option<TariffType>,
}

#[derive(Serialize)]
pub(super) struct PaymentList {
    payments: Vec<Payment>,
}

/// Resolve what a payment request charges, or why it cannot be made.
fn payment_terms(config: &Config, payload: &CreatePayload) -> ApiResult<(i64, Option<TariffType>)> {
    match payload.purpose {
        PaymentPurpose::TopUp => {
            let amount = payload
                .amount
                .ok_or_else(|| ApiError::validation("Amount is required"))?;
            if amount < config.min_top_up || amount > config.max_top_up {
                return Err(ApiError::validation(format!(
                    "Amount must be between {} and {}",
                    config.min_top_up, config.max_top_up
                )));
            }
            Ok((amount, None))
        }
        PaymentPurpose::Subscription => {
            let tariff = payload
                .tariff
                .ok_or_else(|| ApiError::validation("Tariff is required"))?;
            if !config.tariffs.is_purchasable(tariff) {
                return Err(ApiError::validation(format!(
                    "Tariff {} cannot be purchased",
                    tariff
                )));
            }
            Ok((config.tariffs.get(tariff).price, Some(tariff)))
        }
    }
}

fn describe(purpose: PaymentPurpose, tariff: Option<TariffType>) -> String {
    match (purpose, tariff) {
        (PaymentPurpose::Subscription, Some(t)) => format!("Подписка {}", t),
        _ => "Пополнение баланса".to_string(),
    }
}

pub(super) async fn handler_payment_create(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiJson(payload): ApiJson<CreatePayload>,
) -> ApiResult<impl IntoResponse> {
    let (amount, tariff) = payment_terms(&state.config, &payload)?;
    let payment = state
        .db
        .create_payment(user.id, amount, payload.purpose, tariff)
        .await?;

    let request = GatewayPaymentRequest {
        payment_id: payment.id,
        amount,
        description: describe(payload.purpose, tariff),
    };
    let created = match state.gateway.create_payment(&request).await {
        Ok(created) => created,
        Err(e) => {
            warn!(payment_id = %payment.id, error = %e, "gateway rejected payment");
            state.db.mark_payment_failed(payment.id).await?;
            state.prom_metrics.record_payment(PaymentStatus::Failed.as_str());
            return Err(ApiError::Upstream("Payment gateway error".into()));
        }
    };

    let payment = state
        .db
        .attach_gateway(
            payment.id,
            &created.external_id,
            created.confirmation_url.as_deref(),
        )
        .await?;
    state
        .prom_metrics
        .record_payment(PaymentStatus::Processing.as_str());
    info!(payment_id = %payment.id, external_id = %created.external_id, amount, "payment started");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "payment": payment,
            "confirmation_url": created.confirmation_url,
        })),
    ))
}

/// Tell the payer how the payment ended.
async fn announce(state: &AppState, payment: &Payment) {
    match payment.status {
        PaymentStatus::Succeeded => {
            state
                .notifier
                .notify(payment.user_id, drafts::payment_succeeded(payment))
                .await;
            if let (PaymentPurpose::Subscription, Some(tariff)) = (payment.purpose, payment.tariff)
            {
                let expires_at = match state.db.get_user(payment.user_id).await {
                    Ok(user) => user.and_then(|u| u.subscription_expires_at),
                    Err(e) => {
                        warn!(user_id = %payment.user_id, error = %e, "failed to reload subscriber");
                        None
                    }
                };
                state
                    .notifier
                    .notify(
                        payment.user_id,
                        drafts::subscription_activated(tariff, expires_at),
                    )
                    .await;
            }
        }
        PaymentStatus::Failed | PaymentStatus::Cancelled => {
            state
                .notifier
                .notify(payment.user_id, drafts::payment_failed(payment))
                .await;
        }
        PaymentStatus::Pending | PaymentStatus::Processing => {}
    }
}

pub(super) async fn handler_payment_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !payments::verify_signature(&state.config.webhook_secret, &body, signature) {
        warn!("payment callback with bad signature");
        return Err(ApiError::unauthorized("Invalid signature"));
    }
    let payload: CallbackPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("Invalid callback payload: {}", e)))?;

    let outcome = state
        .db
        .complete_payment(&payload.external_id, payload.status.into(), &state.config.tariffs)
        .await?;
    match outcome {
        CompletionOutcome::NotFound => Err(ApiError::not_found("Payment not found")),
        CompletionOutcome::AlreadyFinal(payment) => {
            info!(payment_id = %payment.id, status = %payment.status, "duplicate payment callback ignored");
            Ok(Json(json!({ "status": "ignored" })))
        }
        CompletionOutcome::Applied(payment) => {
            info!(payment_id = %payment.id, status = %payment.status, amount = payment.amount, "payment finalised");
            state.prom_metrics.record_payment(payment.status.as_str());
            announce(&state, &payment).await;
            Ok(Json(json!({ "status": "ok" })))
        }
    }
}

pub(super) async fn handler_payments_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiQuery(page): ApiQuery<Pagination>,
) -> ApiResult<Json<Page<PaymentList>>> {
    let (payments, total) = state.db.list_user_payments(user.id, page).await?;
    Ok(Json(Page::new(PaymentList { payments }, total, page)))
}

pub(super) async fn handler_payment_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    // Someone else's payment reads as missing.
    let payment = state
        .db
        .get_payment(id)
        .await?
        .filter(|p| p.user_id == user.id || user.is_admin())
        .ok_or_else(|| ApiError::not_found("Payment not found"))?;
    Ok(Json(payment))
}
