//! # Payments: Gateway Client and Webhook Signatures
//!
//! Creating a payment asks the gateway for a hosted checkout and returns its
//! id plus the URL the user is redirected to. The gateway later reports the
//! outcome to `POST /api/payments/callback`; the body is authenticated with
//! an `X-Signature` header holding the hex HMAC-SHA256 of the raw body under
//! the shared webhook secret.
//!
//! Two [`PaymentGateway`] implementations:
//!
//! - [`HttpGateway`]: YooKassa-style REST API (basic auth with shop id and
//!   secret key, `Idempotence-Key` header, amounts as decimal strings).
//! - [`SandboxGateway`]: no network. Issues `sandbox-<uuid>` ids and points
//!   the confirmation URL at the configured return URL; the payment is
//!   settled by posting a signed callback.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::{GatewayKind, GatewaySettings};
use crate::db::payments::PaymentStatus;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("payment gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("payment gateway rejected payment ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("payment gateway response missing {0}")]
    MalformedResponse(&'static str),

    #[error("invalid webhook key")]
    InvalidKey,
}

/// What the backend asks the gateway to charge.
#[derive(Debug, Clone)]
pub struct GatewayPaymentRequest {
    pub payment_id: Uuid,
    pub amount: i64,
    pub description: String,
}

/// Gateway's answer to a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub external_id: String,
    pub confirmation_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError>;
}

/// Build the gateway selected by configuration.
pub fn from_settings(settings: &GatewaySettings) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
    match settings.kind {
        GatewayKind::Sandbox => Ok(Arc::new(SandboxGateway::new(settings.return_url.clone()))),
        GatewayKind::Http => Ok(Arc::new(HttpGateway::new(settings)?)),
    }
}

// ── Webhook ─────────────────────────────────────────────────────

/// Body of a gateway status callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub external_id: String,
    pub status: CallbackStatus,
}

/// Final statuses a gateway may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    #[serde(alias = "succeeded")]
    Succeeded,
    #[serde(alias = "canceled", alias = "cancelled", alias = "CANCELED")]
    Cancelled,
    #[serde(alias = "failed")]
    Failed,
}

impl From<CallbackStatus> for PaymentStatus {
    fn from(status: CallbackStatus) -> Self {
        match status {
            CallbackStatus::Succeeded => PaymentStatus::Succeeded,
            CallbackStatus::Cancelled => PaymentStatus::Cancelled,
            CallbackStatus::Failed => PaymentStatus::Failed,
        }
    }
}

fn keyed_mac(secret: &str) -> Result<HmacSha256, GatewayError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| GatewayError::InvalidKey)
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, GatewayError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = keyed_mac(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ── HTTP gateway ────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateBody<'a> {
    amount: Amount,
    capture: bool,
    confirmation: ConfirmationRequest<'a>,
    description: &'a str,
    metadata: Metadata,
}

#[derive(Serialize)]
struct Amount {
    value: String,
    currency: &'static str,
}

#[derive(Serialize)]
struct ConfirmationRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: &'a str,
}

#[derive(Serialize)]
struct Metadata {
    payment_id: Uuid,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: Option<String>,
    confirmation: Option<ConfirmationResponse>,
}

#[derive(Deserialize)]
struct ConfirmationResponse {
    confirmation_url: Option<String>,
}

/// Amount in rubles formatted the way the gateway expects ("990.00").
fn format_amount(rubles: i64) -> String {
    format!("{}.00", rubles)
}

pub struct HttpGateway {
    client: reqwest::Client,
    api_url: String,
    shop_id: String,
    secret_key: String,
    return_url: String,
}

impl HttpGateway {
    pub fn new(settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let api_url = settings
            .api_url
            .clone()
            .ok_or(GatewayError::NotConfigured("PAYMENT_API_URL is required"))?;
        let shop_id = settings
            .shop_id
            .clone()
            .ok_or(GatewayError::NotConfigured("PAYMENT_SHOP_ID is required"))?;
        let secret_key = settings
            .secret_key
            .clone()
            .ok_or(GatewayError::NotConfigured("PAYMENT_SECRET_KEY is required"))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpGateway {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            shop_id,
            secret_key,
            return_url: settings.return_url.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError> {
        let body = CreateBody {
            amount: Amount {
                value: format_amount(request.amount),
                currency: "RUB",
            },
            capture: true,
            confirmation: ConfirmationRequest {
                kind: "redirect",
                return_url: &self.return_url,
            },
            description: &request.description,
            metadata: Metadata {
                payment_id: request.payment_id,
            },
        };
        let resp = self
            .client
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", request.payment_id.to_string())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: CreateResponse = resp.json().await?;
        let external_id = parsed.id.ok_or(GatewayError::MalformedResponse("id"))?;
        debug!(payment_id = %request.payment_id, external_id, "gateway payment created");
        Ok(GatewayPayment {
            external_id,
            confirmation_url: parsed.confirmation.and_then(|c| c.confirmation_url),
        })
    }
}

// ── Sandbox gateway ─────────────────────────────────────────────

pub struct SandboxGateway {
    return_url: String,
}

impl SandboxGateway {
    pub fn new(return_url: String) -> Self {
        SandboxGateway { return_url }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError> {
        let external_id = format!("sandbox-{}", request.payment_id);
        let separator = if self.return_url.contains('?') { '&' } else { '?' };
        Ok(GatewayPayment {
            confirmation_url: Some(format!(
                "{}{}payment={}",
                self.return_url, separator, request.payment_id
            )),
            external_id,
        })
    }
}
