//! # Database: PostgreSQL Storage Layer
//!
//! Async storage for the marketplace via `sqlx::PgPool`. The schema lives in
//! `migrations/` and is applied with [`Database::migrate`].
//!
//! ## Schema
//!
//! - `users`: accounts, roles, balances, tariff and specializations
//! - `orders`: customer job postings and their lifecycle status
//! - `order_responses`: paid executor bids on published orders
//! - `reviews`: moderated ratings left after a completed order
//! - `payments`: gateway payments for top-ups and subscriptions
//! - `notifications`: per-user event feed
//! - `messages`: order-scoped chat history
//! - `verification_codes`: SMS codes for phone verification and password reset
//!
//! ## Module Structure
//!
//! - [`users`]: Account CRUD, profile, specializations, subscriptions
//! - [`orders`]: Order CRUD, visibility-scoped listing, status machine
//! - [`responses`]: Executor responses with balance charging
//! - [`reviews`]: Review eligibility, creation, moderation, ratings
//! - [`payments`]: Payment records and callback completion
//! - [`notifications`]: Notification feed and fan-out inserts
//! - [`messages`]: Order chat persistence
//! - [`verification`]: SMS verification codes
//! - [`admin`]: Aggregate statistics
//!
//! Multi-row mutations (responses, payment completion, subscription
//! purchase, order completion, review moderation) each run in a single
//! transaction and lock the rows they read with `FOR UPDATE`.

pub mod admin;
pub mod messages;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod responses;
pub mod reviews;
pub mod users;
pub mod verification;

use anyhow::Result;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// `?page=&limit=` query parameters shared by every list endpoint.
///
/// Pages are 1-based. Out-of-range values are clamped rather than rejected.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl Pagination {
    pub fn new(page: i64, limit: i64) -> Self {
        Pagination {
            page: Some(page),
            limit: Some(limit),
        }
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.limit())
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Parses the URL by hand so that percent-encoded credentials and pooler
    /// usernames containing dots survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    /// Wrap an existing pool (used by tests that manage their own pool).
    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    ///
    /// Used by the `/readyz` readiness probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// Whitelist a sort direction. Only "asc"/"ASC" are accepted; everything
/// else defaults to "DESC".
pub(crate) fn safe_sort_dir(dir: Option<&str>) -> &'static str {
    match dir {
        Some("asc") | Some("ASC") => "ASC",
        _ => "DESC",
    }
}

/// Escape `%`, `_` and `\` so user input matches literally inside ILIKE.
pub(crate) fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// ── Tests ───────────────────────────────────────────────────────
