//! Aggregate statistics for the admin dashboard.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use super::orders::OrderStatus;
use super::users::{UserRole, UserStatus};
use super::Database;

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub users_total: i64,
    pub users_by_role: BTreeMap<String, i64>,
    pub users_by_status: BTreeMap<String, i64>,
    pub orders_total: i64,
    pub orders_by_status: BTreeMap<String, i64>,
    pub pending_reviews: i64,
    pub payments_succeeded_total: i64,
    pub payments_succeeded_count: i64,
}

impl Database {
    pub async fn admin_stats(&self) -> Result<AdminStats> {
        let roles = sqlx::query_as::<_, (UserRole, i64)>(
            "SELECT role, COUNT(*) FROM users GROUP BY role",
        )
        .fetch_all(&self.pool)
        .await?;
        let statuses = sqlx::query_as::<_, (UserStatus, i64)>(
            "SELECT status, COUNT(*) FROM users GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let orders = sqlx::query_as::<_, (OrderStatus, i64)>(
            "SELECT status, COUNT(*) FROM orders GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let pending_reviews = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reviews WHERE status = 'PENDING'",
        )
        .fetch_one(&self.pool)
        .await?;
        let (payments_succeeded_total, payments_succeeded_count) =
            sqlx::query_as::<_, (i64, i64)>(
                "SELECT COALESCE(SUM(amount), 0)::bigint, COUNT(*)
                 FROM payments WHERE status = 'SUCCEEDED'",
            )
            .fetch_one(&self.pool)
            .await?;

        // Zero-fill so the dashboard always sees every key.
        let mut users_by_role: BTreeMap<String, i64> =
            [UserRole::Customer, UserRole::Executor, UserRole::Admin]
                .iter()
                .map(|r| (r.to_string(), 0))
                .collect();
        users_by_role.extend(roles.into_iter().map(|(r, n)| (r.to_string(), n)));
        let mut users_by_status: BTreeMap<String, i64> =
            [UserStatus::Active, UserStatus::Pending, UserStatus::Blocked]
                .iter()
                .map(|s| (s.to_string(), 0))
                .collect();
        users_by_status.extend(statuses.into_iter().map(|(s, n)| (s.to_string(), n)));
        let mut orders_by_status: BTreeMap<String, i64> = OrderStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        orders_by_status.extend(orders.into_iter().map(|(s, n)| (s.to_string(), n)));

        Ok(AdminStats {
            users_total: users_by_role.values().sum(),
            users_by_role,
            users_by_status,
            orders_total: orders_by_status.values().sum(),
            orders_by_status,
            pending_reviews,
            payments_succeeded_total,
            payments_succeeded_count,
        })
    }
}
