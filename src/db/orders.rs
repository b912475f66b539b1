//! Orders: customer job postings, role-scoped listing and the status machine.
//!
//! ```text
//! PUBLISHED ──assign──▶ IN_PROGRESS ──complete──▶ COMPLETED ──▶ ARCHIVED
//!     │                     │                                     ▲
//!     └──────cancel─────────┴────────▶ CANCELLED ─────────────────┘
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use std::fmt;
use uuid::Uuid;

use super::{like_pattern, safe_sort_dir, Database, Pagination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_category", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Windows,
    Doors,
    Ceilings,
    Balconies,
    Blinds,
    Flooring,
    Furniture,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Windows,
        Category::Doors,
        Category::Ceilings,
        Category::Balconies,
        Category::Blinds,
        Category::Flooring,
        Category::Furniture,
        Category::Other,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Windows => "WINDOWS",
            Category::Doors => "DOORS",
            Category::Ceilings => "CEILINGS",
            Category::Balconies => "BALCONIES",
            Category::Blinds => "BLINDS",
            Category::Flooring => "FLOORING",
            Category::Furniture => "FURNITURE",
            Category::Other => "OTHER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Published,
    InProgress,
    Completed,
    Cancelled,
    Archived,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Published,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Archived,
    ];

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Published, InProgress)
                | (Published, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (Completed, Archived)
                | (Cancelled, Archived)
        )
    }

    /// Statuses from which `target` is reachable in one step.
    pub fn sources_of(target: OrderStatus) -> Vec<OrderStatus> {
        OrderStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Published => "PUBLISHED",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub executor_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub region: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub budget: Option<i64>,
    pub status: OrderStatus,
    pub responses_count: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Whether `user_id` is the customer or the assigned executor.
    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.customer_id == user_id || self.executor_id == Some(user_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    pub region: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub budget: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub region: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub budget: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub category: Option<Category>,
    pub region: Option<String>,
    pub min_budget: Option<i64>,
    pub max_budget: Option<i64>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

impl OrderFilter {
    /// Whitelist sort column to prevent SQL injection.
    /// Unknown values default to "created_at".
    pub(crate) fn safe_sort_column(&self) -> &'static str {
        match self.sort_by.as_deref() {
            Some("budget") => "budget",
            Some("responses_count") => "responses_count",
            _ => "created_at",
        }
    }
}

/// Which orders a caller may list.
#[derive(Debug, Clone)]
pub enum OrderScope {
    All,
    /// A customer's own orders.
    Customer(Uuid),
    /// Published orders in the executor's specializations (and region, when
    /// set), plus orders assigned to the executor.
    Executor {
        id: Uuid,
        specializations: Vec<Category>,
        region: Option<String>,
    },
}

const ORDER_COLUMNS: &str = "id, customer_id, executor_id, title, description, category, region,
    address, latitude, longitude, budget, status, responses_count, completed_at, created_at,
    updated_at";

impl Database {
    pub async fn create_order(&self, customer_id: Uuid, new: &NewOrder) -> Result<Order> {
        let sql = format!(
            "INSERT INTO orders (id, customer_id, title, description, category, region, address,
                                 latitude, longitude, budget)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {}",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(Uuid::new_v4())
            .bind(customer_id)
            .bind(new.title.trim())
            .bind(new.description.trim())
            .bind(new.category)
            .bind(new.region.trim())
            .bind(new.address.trim())
            .bind(new.latitude)
            .bind(new.longitude)
            .bind(new.budget)
            .fetch_one(&self.pool)
            .await?;
        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    pub async fn list_orders(
        &self,
        scope: &OrderScope,
        filter: &OrderFilter,
        page: Pagination,
    ) -> Result<(Vec<Order>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM orders WHERE TRUE");
        push_order_conditions(&mut count, scope, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut list = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM orders WHERE TRUE",
            ORDER_COLUMNS
        ));
        push_order_conditions(&mut list, scope, filter);
        list.push(format!(
            " ORDER BY {} {} NULLS LAST, id LIMIT ",
            filter.safe_sort_column(),
            safe_sort_dir(filter.sort_dir.as_deref())
        ))
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
        let orders = list.build_query_as::<Order>().fetch_all(&self.pool).await?;
        Ok((orders, total))
    }

    pub async fn update_order(&self, id: Uuid, update: &OrderUpdate) -> Result<Option<Order>> {
        let sql = format!(
            "UPDATE orders SET
               title = COALESCE($2, title),
               description = COALESCE($3, description),
               category = COALESCE($4, category),
               region = COALESCE($5, region),
               address = COALESCE($6, address),
               latitude = COALESCE($7, latitude),
               longitude = COALESCE($8, longitude),
               budget = COALESCE($9, budget),
               updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .bind(update.title.as_deref().map(str::trim))
            .bind(update.description.as_deref().map(str::trim))
            .bind(update.category)
            .bind(update.region.as_deref().map(str::trim))
            .bind(update.address.as_deref().map(str::trim))
            .bind(update.latitude)
            .bind(update.longitude)
            .bind(update.budget)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    pub async fn delete_order(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move an order to `target` if its current status allows it.
    ///
    /// Returns `None` when the order is missing or its status changed
    /// underneath the caller.
    pub async fn transition_order(&self, id: Uuid, target: OrderStatus) -> Result<Option<Order>> {
        let sql = format!(
            "UPDATE orders SET status = $2, updated_at = NOW()
             WHERE id = $1 AND status = ANY($3)
             RETURNING {}",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .bind(target)
            .bind(OrderStatus::sources_of(target))
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    /// Assign an executor who responded to a published order.
    pub async fn assign_executor(&self, id: Uuid, executor_id: Uuid) -> Result<Option<Order>> {
        let sql = format!(
            "UPDATE orders SET status = 'IN_PROGRESS', executor_id = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'PUBLISHED'
               AND EXISTS (SELECT 1 FROM order_responses r
                           WHERE r.order_id = $1 AND r.executor_id = $2)
             RETURNING {}",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .bind(executor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    /// Complete an in-progress order and bump the executor's counter.
    pub async fn complete_order(&self, id: Uuid) -> Result<Option<Order>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE orders SET status = 'COMPLETED', completed_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = 'IN_PROGRESS'
             RETURNING {}",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(order) = order else {
            return Ok(None);
        };
        if let Some(executor_id) = order.executor_id {
            sqlx::query(
                "UPDATE users SET completed_orders = completed_orders + 1, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(executor_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Some(order))
    }
}

fn push_order_conditions<'a>(
    qb: &mut QueryBuilder<'a, Postgres>,
    scope: &'a OrderScope,
    filter: &'a OrderFilter,
) {
    match scope {
        OrderScope::All => {}
        OrderScope::Customer(id) => {
            qb.push(" AND customer_id = ").push_bind(*id);
        }
        OrderScope::Executor {
            id,
            specializations,
            region,
        } => {
            qb.push(" AND (executor_id = ")
                .push_bind(*id)
                .push(" OR (status = 'PUBLISHED' AND category = ANY(")
                .push_bind(specializations.clone())
                .push(")");
            if let Some(region) = region.as_deref().filter(|r| !r.trim().is_empty()) {
                qb.push(" AND region = ").push_bind(region.trim().to_string());
            }
            qb.push("))");
        }
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(category) = filter.category {
        qb.push(" AND category = ").push_bind(category);
    }
    if let Some(region) = filter.region.as_deref().filter(|r| !r.trim().is_empty()) {
        qb.push(" AND region = ").push_bind(region.trim().to_string());
    }
    if let Some(min) = filter.min_budget {
        qb.push(" AND budget >= ").push_bind(min);
    }
    if let Some(max) = filter.max_budget {
        qb.push(" AND budget <= ").push_bind(max);
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search.trim());
        qb.push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}
