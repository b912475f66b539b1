//! User accounts: registration, profile, specializations, balances and
//! subscription state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::fmt;
use uuid::Uuid;

use super::orders::Category;
use super::{like_pattern, Database, Pagination};
use crate::tariff::{self, Charge, TariffTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Customer,
    Executor,
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Customer => write!(f, "CUSTOMER"),
            UserRole::Executor => write!(f, "EXECUTOR"),
            UserRole::Admin => write!(f, "ADMIN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Active,
    Pending,
    Blocked,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserStatus::Active => write!(f, "ACTIVE"),
            UserStatus::Pending => write!(f, "PENDING"),
            UserStatus::Blocked => write!(f, "BLOCKED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tariff_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TariffType {
    Standard,
    Comfort,
    Premium,
}

impl TariffType {
    pub const ALL: [TariffType; 3] = [TariffType::Standard, TariffType::Comfort, TariffType::Premium];
}

impl fmt::Display for TariffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TariffType::Standard => write!(f, "STANDARD"),
            TariffType::Comfort => write!(f, "COMFORT"),
            TariffType::Premium => write!(f, "PREMIUM"),
        }
    }
}

/// Full account row. The password hash never leaves the server.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub phone: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub phone_verified: bool,
    pub region: Option<String>,
    pub about: Option<String>,
    pub avatar_url: Option<String>,
    pub specializations: Vec<Category>,
    pub rating: f64,
    pub reviews_count: i32,
    pub completed_orders: i32,
    pub balance: i64,
    pub bonus_balance: i64,
    pub tariff: TariffType,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// The tariff in force at `now`. A lapsed paid period counts as
    /// STANDARD even before the sweep has reverted the row.
    pub fn effective_tariff(&self, now: DateTime<Utc>) -> TariffType {
        match self.subscription_expires_at {
            Some(expiry) if self.tariff != TariffType::Standard && expiry <= now => {
                TariffType::Standard
            }
            _ => self.tariff,
        }
    }
}

/// Public view of an account: no phone, email or balances.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PublicProfile {
    pub id: Uuid,
    pub name: String,
    pub role: UserRole,
    pub region: Option<String>,
    pub about: Option<String>,
    pub avatar_url: Option<String>,
    pub specializations: Vec<Category>,
    pub rating: f64,
    pub reviews_count: i32,
    pub completed_orders: i32,
    pub created_at: DateTime<Utc>,
}

pub struct NewUser<'a> {
    pub phone: &'a str,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub role: UserRole,
    pub status: UserStatus,
    pub phone_verified: bool,
    pub bonus_balance: i64,
}

/// Profile fields a user may change. `None` leaves the column untouched.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub region: Option<String>,
    pub about: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    pub role: Option<UserRole>,
    pub status: Option<UserStatus>,
    pub search: Option<String>,
}

/// Admin-side changes to an account.
#[derive(Debug, Default, Deserialize)]
pub struct AdminUserUpdate {
    pub status: Option<UserStatus>,
    pub role: Option<UserRole>,
    #[serde(default)]
    pub balance_delta: i64,
    #[serde(default)]
    pub bonus_delta: i64,
}

/// Result of buying a subscription from the account balance.
#[derive(Debug)]
pub enum PurchaseOutcome {
    Activated { user: User, charge: Charge },
    InsufficientFunds { required: i64, available: i64 },
    UserNotFound,
}

const USER_COLUMNS: &str = "id, phone, email, password_hash, name, role, status, phone_verified,
    region, about, avatar_url, specializations, rating, reviews_count, completed_orders,
    balance, bonus_balance, tariff, subscription_expires_at, created_at, updated_at";

impl Database {
    /// Insert a new account. Returns `None` when the phone is already taken.
    pub async fn create_user(&self, new: &NewUser<'_>) -> Result<Option<User>> {
        let sql = format!(
            "INSERT INTO users (id, phone, password_hash, name, role, status, phone_verified, bonus_balance)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (phone) DO NOTHING
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.phone)
            .bind(new.password_hash)
            .bind(new.name)
            .bind(new.role)
            .bind(new.status)
            .bind(new.phone_verified)
            .bind(new.bonus_balance)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE phone = $1", USER_COLUMNS);
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Mark a PENDING account's phone as verified and activate it.
    pub async fn activate_user(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET status = 'ACTIVE', phone_verified = TRUE, updated_at = NOW()
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET
               name = COALESCE($2, name),
               email = COALESCE($3, email),
               region = COALESCE($4, region),
               about = COALESCE($5, about),
               avatar_url = COALESCE($6, avatar_url),
               updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(update.name.as_deref())
            .bind(update.email.as_deref())
            .bind(update.region.as_deref())
            .bind(update.about.as_deref())
            .bind(update.avatar_url.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn set_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_specializations(&self, id: Uuid, specs: &[Category]) -> Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET specializations = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(specs)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Public profile of a non-blocked account.
    pub async fn get_public_profile(&self, id: Uuid) -> Result<Option<PublicProfile>> {
        let row = sqlx::query_as::<_, PublicProfile>(
            "SELECT id, name, role, region, about, avatar_url, specializations, rating,
                    reviews_count, completed_orders, created_at
             FROM users WHERE id = $1 AND status <> 'BLOCKED'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Buy a tariff period from the account balance (bonus first).
    pub async fn purchase_subscription(
        &self,
        user_id: Uuid,
        purchased: TariffType,
        tariffs: &TariffTable,
    ) -> Result<PurchaseOutcome> {
        let price = tariffs.get(purchased).price;
        let mut tx = self.pool.begin().await?;

        let funds = sqlx::query_as::<_, (i64, i64)>(
            "SELECT balance, bonus_balance FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((balance, bonus)) = funds else {
            return Ok(PurchaseOutcome::UserNotFound);
        };
        let Some(charge) = tariff::split_charge(price, bonus, balance) else {
            return Ok(PurchaseOutcome::InsufficientFunds {
                required: price,
                available: balance + bonus,
            });
        };

        debit(&mut tx, user_id, charge).await?;
        let user = apply_subscription(&mut tx, user_id, purchased, tariffs).await?;
        tx.commit().await?;
        Ok(PurchaseOutcome::Activated { user, charge })
    }

    /// Revert expired paid tariffs to STANDARD and trim specializations to
    /// the STANDARD limit. Returns the affected user ids.
    pub async fn expire_subscriptions(&self, standard_limit: usize) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "UPDATE users SET
               tariff = 'STANDARD',
               subscription_expires_at = NULL,
               specializations = COALESCE(specializations[1:$1], '{}'),
               updated_at = NOW()
             WHERE tariff <> 'STANDARD'
               AND subscription_expires_at IS NOT NULL
               AND subscription_expires_at <= NOW()
             RETURNING id",
        )
        .bind(standard_limit as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // ── Admin ─────────────────────────────────────────────────────

    pub async fn list_users(
        &self,
        filter: &UserFilter,
        page: Pagination,
    ) -> Result<(Vec<User>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users WHERE TRUE");
        push_user_conditions(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut list = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM users WHERE TRUE",
            USER_COLUMNS
        ));
        push_user_conditions(&mut list, filter);
        list.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let users = list.build_query_as::<User>().fetch_all(&self.pool).await?;
        Ok((users, total))
    }

    /// Apply an admin update. Balance deltas are clamped at zero.
    pub async fn admin_update_user(
        &self,
        id: Uuid,
        update: &AdminUserUpdate,
    ) -> Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET
               status = COALESCE($2, status),
               role = COALESCE($3, role),
               balance = GREATEST(balance + $4, 0),
               bonus_balance = GREATEST(bonus_balance + $5, 0),
               updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(update.status)
            .bind(update.role)
            .bind(update.balance_delta)
            .bind(update.bonus_delta)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn delete_user(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn push_user_conditions<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a UserFilter) {
    if let Some(role) = filter.role {
        qb.push(" AND role = ").push_bind(role);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search.trim());
        qb.push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR phone ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Subtract a split charge from a locked user row.
pub(crate) async fn debit(conn: &mut PgConnection, user_id: Uuid, charge: Charge) -> Result<()> {
    sqlx::query(
        "UPDATE users SET
           bonus_balance = bonus_balance - $2,
           balance = balance - $3,
           updated_at = NOW()
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(charge.from_bonus)
    .bind(charge.from_balance)
    .execute(conn)
    .await?;
    Ok(())
}

/// Switch a user to `purchased` and move the expiry forward by one period.
/// The caller owns the transaction and should already hold the row lock.
pub(crate) async fn apply_subscription(
    conn: &mut PgConnection,
    user_id: Uuid,
    purchased: TariffType,
    tariffs: &TariffTable,
) -> Result<User> {
    let (current, expiry) = sqlx::query_as::<_, (TariffType, Option<DateTime<Utc>>)>(
        "SELECT tariff, subscription_expires_at FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    let new_expiry = tariff::extended_expiry(
        current,
        expiry,
        purchased,
        Utc::now(),
        tariffs.get(purchased).period_days,
    );
    // A cheaper tariff may allow fewer specializations than the user holds.
    let sql = format!(
        "UPDATE users SET
           tariff = $2,
           subscription_expires_at = $3,
           specializations = COALESCE(specializations[1:$4], '{{}}'),
           updated_at = NOW()
         WHERE id = $1
         RETURNING {}",
        USER_COLUMNS
    );
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .bind(purchased)
        .bind(new_expiry)
        .bind(tariffs.specialization_limit(purchased) as i32)
        .fetch_one(&mut *conn)
        .await?;
    Ok(user)
}
