//! Payments: gateway-backed balance top-ups and subscription purchases.
//!
//! A payment is created PENDING, becomes PROCESSING once the gateway
//! accepts it, and is finalised by the gateway callback. Finalisation is
//! idempotent: a second callback for a payment already in a final state is
//! a no-op.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::users::{apply_subscription, TariffType};
use super::{Database, Pagination};
use crate::tariff::TariffTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_purpose", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentPurpose {
    TopUp,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::Succeeded,
        PaymentStatus::Cancelled,
        PaymentStatus::Failed,
    ];

    pub fn is_final(self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Cancelled | PaymentStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub purpose: PaymentPurpose,
    pub tariff: Option<TariffType>,
    pub status: PaymentStatus,
    pub external_id: Option<String>,
    pub confirmation_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub purpose: Option<PaymentPurpose>,
    pub user_id: Option<Uuid>,
}

/// Result of applying a gateway callback.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Status changed; funds or subscription applied on success.
    Applied(Payment),
    /// Payment was already final; nothing changed.
    AlreadyFinal(Payment),
    NotFound,
}

const PAYMENT_COLUMNS: &str = "id, user_id, amount, purpose, tariff, status, external_id,
    confirmation_url, created_at, updated_at";

impl Database {
    pub async fn create_payment(
        &self,
        user_id: Uuid,
        amount: i64,
        purpose: PaymentPurpose,
        tariff: Option<TariffType>,
    ) -> Result<Payment> {
        let sql = format!(
            "INSERT INTO payments (id, user_id, amount, purpose, tariff)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(amount)
            .bind(purpose)
            .bind(tariff)
            .fetch_one(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Record the gateway's id and confirmation URL and mark PROCESSING.
    pub async fn attach_gateway(
        &self,
        id: Uuid,
        external_id: &str,
        confirmation_url: Option<&str>,
    ) -> Result<Payment> {
        let sql = format!(
            "UPDATE payments SET external_id = $2, confirmation_url = $3,
                    status = 'PROCESSING', updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .bind(external_id)
            .bind(confirmation_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Mark a payment FAILED when the gateway rejected creation.
    pub async fn mark_payment_failed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET status = 'FAILED', updated_at = NOW()
             WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row = sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_user_payments(
        &self,
        user_id: Uuid,
        page: Pagination,
    ) -> Result<(Vec<Payment>, i64)> {
        let filter = PaymentFilter {
            user_id: Some(user_id),
            ..Default::default()
        };
        self.list_payments(&filter, page).await
    }

    pub async fn list_payments(
        &self,
        filter: &PaymentFilter,
        page: Pagination,
    ) -> Result<(Vec<Payment>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM payments
             WHERE ($1::payment_status IS NULL OR status = $1)
               AND ($2::payment_purpose IS NULL OR purpose = $2)
               AND ($3::uuid IS NULL OR user_id = $3)",
        )
        .bind(filter.status)
        .bind(filter.purpose)
        .bind(filter.user_id)
        .fetch_one(&self.pool)
        .await?;
        let sql = format!(
            "SELECT {} FROM payments
             WHERE ($1::payment_status IS NULL OR status = $1)
               AND ($2::payment_purpose IS NULL OR purpose = $2)
               AND ($3::uuid IS NULL OR user_id = $3)
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5",
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Payment>(&sql)
            .bind(filter.status)
            .bind(filter.purpose)
            .bind(filter.user_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        Ok((rows, total))
    }

    /// Finalise a payment identified by the gateway's id.
    ///
    /// On SUCCEEDED a top-up credits `balance` and a subscription payment
    /// activates its tariff, in the same transaction as the status change.
    pub async fn complete_payment(
        &self,
        external_id: &str,
        status: PaymentStatus,
        tariffs: &TariffTable,
    ) -> Result<CompletionOutcome> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {} FROM payments WHERE external_id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        );
        let current = sqlx::query_as::<_, Payment>(&sql)
            .bind(external_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            return Ok(CompletionOutcome::NotFound);
        };
        if current.status.is_final() || !status.is_final() {
            return Ok(CompletionOutcome::AlreadyFinal(current));
        }

        let sql = format!(
            "UPDATE payments SET status = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(current.id)
            .bind(status)
            .fetch_one(&mut *tx)
            .await?;

        if status == PaymentStatus::Succeeded {
            match (payment.purpose, payment.tariff) {
                (PaymentPurpose::TopUp, _) => {
                    sqlx::query(
                        "UPDATE users SET balance = balance + $2, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(payment.user_id)
                    .bind(payment.amount)
                    .execute(&mut *tx)
                    .await?;
                }
                (PaymentPurpose::Subscription, Some(tariff)) => {
                    apply_subscription(&mut tx, payment.user_id, tariff, tariffs).await?;
                }
                (PaymentPurpose::Subscription, None) => {
                    anyhow::bail!("subscription payment {} has no tariff", payment.id);
                }
            }
        }

        tx.commit().await?;
        Ok(CompletionOutcome::Applied(payment))
    }
}
