//! # SMS: Verification Code Delivery
//!
//! The backend only needs to push a short text to a phone number, so the
//! provider sits behind the [`SmsSender`] trait:
//!
//! - [`HttpSmsSender`] posts `{to, from, text}` as JSON to a provider URL
//!   with a bearer API key.
//! - [`LogSmsSender`] writes the message to the log and keeps it in memory.
//!   Used in development and by the integration tests to read codes back.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{SmsProvider, SmsSettings};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms provider is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("sms request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sms provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SmsError>;
}

/// Build the sender selected by configuration.
pub fn from_settings(settings: &SmsSettings) -> Result<Arc<dyn SmsSender>, SmsError> {
    match settings.provider {
        SmsProvider::Log => Ok(Arc::new(LogSmsSender::default())),
        SmsProvider::Http => {
            let api_url = settings
                .api_url
                .clone()
                .ok_or(SmsError::NotConfigured("SMS_API_URL is required"))?;
            let api_key = settings
                .api_key
                .clone()
                .ok_or(SmsError::NotConfigured("SMS_API_KEY is required"))?;
            Ok(Arc::new(HttpSmsSender::new(
                api_url,
                api_key,
                settings.sender.clone(),
            )?))
        }
    }
}

pub fn code_text(code: &str) -> String {
    format!("SVMontaj: ваш код подтверждения {}", code)
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    from: &'a str,
    text: &'a str,
}

pub struct HttpSmsSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

impl HttpSmsSender {
    pub fn new(api_url: String, api_key: String, sender: String) -> Result<Self, SmsError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpSmsSender {
            client,
            api_url,
            api_key,
            sender,
        })
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SmsError> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&SmsRequest {
                to: phone,
                from: &self.sender,
                text,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SmsError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(phone, "sms sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    pub phone: String,
    pub text: String,
}

/// Logs messages instead of sending them and remembers what was "sent".
#[derive(Default)]
pub struct LogSmsSender {
    sent: Mutex<Vec<SentSms>>,
}

impl LogSmsSender {
    pub fn sent(&self) -> Vec<SentSms> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recent 6-digit code sent to `phone`, if any.
    pub fn last_code_for(&self, phone: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.phone == phone)
            .and_then(|m| extract_code(&m.text))
    }
}

fn extract_code(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|w| w.len() == crate::auth::CODE_LEN)
        .map(str::to_string)
}

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SmsError> {
        info!(phone, text, "sms (log provider)");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentSms {
                phone: phone.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}
