//! Order responses: an executor's paid bid on a published order.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::orders::{Category, OrderStatus};
use super::users::debit;
use super::{Database, Pagination};
use crate::tariff::{self, Charge};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub executor_id: Uuid,
    pub message: String,
    pub price: Option<i64>,
    pub cost_charged: i64,
    pub created_at: DateTime<Utc>,
}

/// A response as the customer sees it, with the executor's public stats.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ResponseWithExecutor {
    pub id: Uuid,
    pub order_id: Uuid,
    pub executor_id: Uuid,
    pub message: String,
    pub price: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub executor_name: String,
    pub executor_avatar_url: Option<String>,
    pub executor_rating: f64,
    pub executor_reviews_count: i32,
    pub executor_completed_orders: i32,
}

/// A response as the executor sees it, with the order summary.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ResponseWithOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub message: String,
    pub price: Option<i64>,
    pub cost_charged: i64,
    pub created_at: DateTime<Utc>,
    pub order_title: String,
    pub order_category: Category,
    pub order_region: String,
    pub order_status: OrderStatus,
    pub assigned_to_me: bool,
}

pub struct NewResponse<'a> {
    pub order_id: Uuid,
    pub executor_id: Uuid,
    pub message: &'a str,
    pub price: Option<i64>,
    pub cost: i64,
}

#[derive(Debug)]
pub enum ResponseOutcome {
    Created {
        response: OrderResponse,
        charge: Charge,
    },
    OrderNotFound,
    OrderNotOpen(OrderStatus),
    AlreadyResponded,
    InsufficientFunds {
        required: i64,
        available: i64,
    },
}

impl Database {
    /// Record a response, charging the executor and bumping the order's
    /// response counter in one transaction.
    pub async fn create_response(&self, new: &NewResponse<'_>) -> Result<ResponseOutcome> {
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, OrderStatus>(
            "SELECT status FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(new.order_id)
        .fetch_optional(&mut *tx)
        .await?;
        match status {
            None => return Ok(ResponseOutcome::OrderNotFound),
            Some(OrderStatus::Published) => {}
            Some(other) => return Ok(ResponseOutcome::OrderNotOpen(other)),
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM order_responses WHERE order_id = $1 AND executor_id = $2)",
        )
        .bind(new.order_id)
        .bind(new.executor_id)
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            return Ok(ResponseOutcome::AlreadyResponded);
        }

        let (balance, bonus) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT balance, bonus_balance FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(new.executor_id)
        .fetch_one(&mut *tx)
        .await?;
        let Some(charge) = tariff::split_charge(new.cost, bonus, balance) else {
            return Ok(ResponseOutcome::InsufficientFunds {
                required: new.cost,
                available: balance + bonus,
            });
        };
        debit(&mut tx, new.executor_id, charge).await?;

        let response = sqlx::query_as::<_, OrderResponse>(
            "INSERT INTO order_responses (id, order_id, executor_id, message, price, cost_charged)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, order_id, executor_id, message, price, cost_charged, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.order_id)
        .bind(new.executor_id)
        .bind(new.message.trim())
        .bind(new.price)
        .bind(charge.total())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE orders SET responses_count = responses_count + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(new.order_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ResponseOutcome::Created { response, charge })
    }

    pub async fn has_responded(&self, order_id: Uuid, executor_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM order_responses WHERE order_id = $1 AND executor_id = $2)",
        )
        .bind(order_id)
        .bind(executor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// All responses on an order, newest first. Pass `executor_id` to see
    /// only that executor's response.
    pub async fn list_order_responses(
        &self,
        order_id: Uuid,
        executor_id: Option<Uuid>,
    ) -> Result<Vec<ResponseWithExecutor>> {
        let rows = sqlx::query_as::<_, ResponseWithExecutor>(
            "SELECT r.id, r.order_id, r.executor_id, r.message, r.price, r.created_at,
                    u.name AS executor_name, u.avatar_url AS executor_avatar_url,
                    u.rating AS executor_rating, u.reviews_count AS executor_reviews_count,
                    u.completed_orders AS executor_completed_orders
             FROM order_responses r
             JOIN users u ON u.id = r.executor_id
             WHERE r.order_id = $1 AND ($2::uuid IS NULL OR r.executor_id = $2)
             ORDER BY r.created_at DESC",
        )
        .bind(order_id)
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_executor_responses(
        &self,
        executor_id: Uuid,
        page: Pagination,
    ) -> Result<(Vec<ResponseWithOrder>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM order_responses WHERE executor_id = $1",
        )
        .bind(executor_id)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query_as::<_, ResponseWithOrder>(
            "SELECT r.id, r.order_id, r.message, r.price, r.cost_charged, r.created_at,
                    o.title AS order_title, o.category AS order_category,
                    o.region AS order_region, o.status AS order_status,
                    COALESCE(o.executor_id = r.executor_id, FALSE) AS assigned_to_me
             FROM order_responses r
             JOIN orders o ON o.id = r.order_id
             WHERE r.executor_id = $1
             ORDER BY r.created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(executor_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }
}
