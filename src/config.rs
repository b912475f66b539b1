//! # Config: Server Settings
//!
//! Process settings come from CLI flags with environment fallbacks (and a
//! `.env` file loaded by `main`). The tariff table is the only structured
//! setting and lives in an optional TOML file.
//!
//! | Flag | Env | Default |
//! |------|-----|---------|
//! | `--jwt-secret` | `JWT_SECRET` | required |
//! | `--token-ttl-hours` | `TOKEN_TTL_HOURS` | 720 |
//! | `--code-ttl-secs` | `CODE_TTL_SECS` | 600 |
//! | `--code-resend-secs` | `CODE_RESEND_SECS` | 60 |
//! | `--welcome-bonus` | `WELCOME_BONUS` | 300 |
//! | `--min-top-up` / `--max-top-up` | `MIN_TOP_UP` / `MAX_TOP_UP` | 100 / 100000 |
//! | `--webhook-secret` | `PAYMENT_WEBHOOK_SECRET` | required |
//! | `--tariffs-file` | `TARIFFS_FILE` | built-in table |
//! | `--sms-provider` | `SMS_PROVIDER` | `log` |
//! | `--payment-gateway` | `PAYMENT_GATEWAY` | `sandbox` |

use anyhow::{bail, Result};
use chrono::Duration;
use clap::{Args, ValueEnum};
use std::path::PathBuf;

use crate::tariff::TariffTable;

/// Verification code attempts before the code is burned.
pub const CODE_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SmsProvider {
    /// Log codes instead of sending them (development).
    Log,
    /// POST messages to an HTTP SMS gateway.
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GatewayKind {
    /// Local sandbox: payments are confirmed by a signed callback.
    Sandbox,
    /// Hosted payment gateway over HTTP.
    Http,
}

/// Raw CLI/env settings for the `serve` subcommand.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Secret used to sign session tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Session token lifetime in hours
    #[arg(long, env = "TOKEN_TTL_HOURS", default_value_t = 720)]
    pub token_ttl_hours: i64,

    /// Verification code lifetime in seconds
    #[arg(long, env = "CODE_TTL_SECS", default_value_t = 600)]
    pub code_ttl_secs: i64,

    /// Minimum delay between two codes sent to the same phone
    #[arg(long, env = "CODE_RESEND_SECS", default_value_t = 60)]
    pub code_resend_secs: i64,

    /// Bonus balance credited to new accounts
    #[arg(long, env = "WELCOME_BONUS", default_value_t = 300)]
    pub welcome_bonus: i64,

    /// Smallest accepted balance top-up (rubles)
    #[arg(long, env = "MIN_TOP_UP", default_value_t = 100)]
    pub min_top_up: i64,

    /// Largest accepted balance top-up (rubles)
    #[arg(long, env = "MAX_TOP_UP", default_value_t = 100_000)]
    pub max_top_up: i64,

    /// Shared secret for payment webhook signatures
    #[arg(long, env = "PAYMENT_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// TOML file overriding the built-in tariff table
    #[arg(long, env = "TARIFFS_FILE")]
    pub tariffs_file: Option<PathBuf>,

    /// Interval between subscription expiry sweeps, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SMS_PROVIDER", value_enum, default_value_t = SmsProvider::Log)]
    pub sms_provider: SmsProvider,

    /// SMS gateway endpoint (http provider)
    #[arg(long, env = "SMS_API_URL")]
    pub sms_api_url: Option<String>,

    #[arg(long, env = "SMS_API_KEY", hide_env_values = true)]
    pub sms_api_key: Option<String>,

    /// Sender name shown on SMS messages
    #[arg(long, env = "SMS_SENDER", default_value = "SVMontaj")]
    pub sms_sender: String,

    #[arg(long, env = "PAYMENT_GATEWAY", value_enum, default_value_t = GatewayKind::Sandbox)]
    pub payment_gateway: GatewayKind,

    /// Payment gateway API base URL (http gateway)
    #[arg(long, env = "PAYMENT_API_URL")]
    pub payment_api_url: Option<String>,

    #[arg(long, env = "PAYMENT_SHOP_ID")]
    pub payment_shop_id: Option<String>,

    #[arg(long, env = "PAYMENT_SECRET_KEY", hide_env_values = true)]
    pub payment_secret_key: Option<String>,

    /// Where the gateway sends the user after paying
    #[arg(
        long,
        env = "PAYMENT_RETURN_URL",
        default_value = "http://localhost:3000/profile/balance"
    )]
    pub payment_return_url: String,
}

#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub provider: SmsProvider,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub kind: GatewayKind,
    pub api_url: Option<String>,
    pub shop_id: Option<String>,
    pub secret_key: Option<String>,
    pub return_url: String,
}

/// Validated server settings shared through `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub code_ttl: Duration,
    pub code_resend: Duration,
    pub welcome_bonus: i64,
    pub min_top_up: i64,
    pub max_top_up: i64,
    pub webhook_secret: String,
    pub sweep_interval: std::time::Duration,
    pub tariffs: TariffTable,
    pub sms: SmsSettings,
    pub gateway: GatewaySettings,
}

impl Config {
    pub fn from_args(args: &ConfigArgs) -> Result<Self> {
        let jwt_secret = match args.jwt_secret.as_deref() {
            Some(s) if s.len() >= 16 => s.to_string(),
            Some(_) => bail!("JWT_SECRET must be at least 16 characters"),
            None => bail!("JWT_SECRET is required (set via --jwt-secret or env)"),
        };
        let webhook_secret = args.webhook_secret.clone().ok_or_else(|| {
            anyhow::anyhow!("PAYMENT_WEBHOOK_SECRET is required (set via --webhook-secret or env)")
        })?;
        if args.token_ttl_hours <= 0 {
            bail!("token TTL must be positive");
        }
        if args.code_ttl_secs <= 0 || args.code_resend_secs < 0 {
            bail!("verification code timings must be positive");
        }
        if args.welcome_bonus < 0 {
            bail!("welcome bonus must not be negative");
        }
        if args.min_top_up <= 0 || args.max_top_up < args.min_top_up {
            bail!("top-up limits must satisfy 0 < min <= max");
        }
        if args.sms_provider == SmsProvider::Http && args.sms_api_url.is_none() {
            bail!("SMS_API_URL is required for the http SMS provider");
        }
        if args.payment_gateway == GatewayKind::Http
            && (args.payment_api_url.is_none()
                || args.payment_shop_id.is_none()
                || args.payment_secret_key.is_none())
        {
            bail!("PAYMENT_API_URL, PAYMENT_SHOP_ID and PAYMENT_SECRET_KEY are required for the http gateway");
        }
        let tariffs = match &args.tariffs_file {
            Some(path) => TariffTable::load(path)?,
            None => TariffTable::default(),
        };

        Ok(Config {
            jwt_secret,
            token_ttl: Duration::hours(args.token_ttl_hours),
            code_ttl: Duration::seconds(args.code_ttl_secs),
            code_resend: Duration::seconds(args.code_resend_secs),
            welcome_bonus: args.welcome_bonus,
            min_top_up: args.min_top_up,
            max_top_up: args.max_top_up,
            webhook_secret,
            sweep_interval: std::time::Duration::from_secs(args.sweep_interval_secs.max(1)),
            tariffs,
            sms: SmsSettings {
                provider: args.sms_provider,
                api_url: args.sms_api_url.clone(),
                api_key: args.sms_api_key.clone(),
                sender: args.sms_sender.clone(),
            },
            gateway: GatewaySettings {
                kind: args.payment_gateway,
                api_url: args.payment_api_url.clone(),
                shop_id: args.payment_shop_id.clone(),
                secret_key: args.payment_secret_key.clone(),
                return_url: args.payment_return_url.clone(),
            },
        })
    }

    /// Settings for local development and tests: logged SMS, sandbox
    /// payments, fixed secrets and no resend throttle.
    pub fn development() -> Self {
        Config {
            jwt_secret: "development-secret-change-me".to_string(),
            token_ttl: Duration::hours(720),
            code_ttl: Duration::seconds(600),
            code_resend: Duration::seconds(0),
            welcome_bonus: 300,
            min_top_up: 100,
            max_top_up: 100_000,
            webhook_secret: "development-webhook-secret".to_string(),
            sweep_interval: std::time::Duration::from_secs(300),
            tariffs: TariffTable::default(),
            sms: SmsSettings {
                provider: SmsProvider::Log,
                api_url: None,
                api_key: None,
                sender: "SVMontaj".to_string(),
            },
            gateway: GatewaySettings {
                kind: GatewayKind::Sandbox,
                api_url: None,
                shop_id: None,
                secret_key: None,
                return_url: "http://localhost:3000/profile/balance".to_string(),
            },
        }
    }
}
