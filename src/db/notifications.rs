//! Notification feed persistence and fan-out inserts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::orders::Order;
use super::users::UserRole;
use super::{Database, Pagination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    NewOrder,
    NewResponse,
    OrderAssigned,
    OrderCompleted,
    OrderCancelled,
    NewMessage,
    NewReview,
    ReviewModerated,
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionActivated,
    SubscriptionExpired,
    AccountStatus,
    System,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub order_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// A notification before it has a recipient row.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl NotificationQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination {
            page: self.page,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub total: i64,
    pub unread: i64,
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, body, order_id, is_read, created_at";

impl Database {
    pub async fn insert_notification(
        &self,
        user_id: Uuid,
        draft: &NotificationDraft,
    ) -> Result<Notification> {
        let sql = format!(
            "INSERT INTO notifications (id, user_id, kind, title, body, order_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            NOTIFICATION_COLUMNS
        );
        let row = sqlx::query_as::<_, Notification>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(draft.kind)
            .bind(&draft.title)
            .bind(&draft.body)
            .bind(draft.order_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// Insert one notification per recipient in a single statement.
    pub async fn insert_notifications(
        &self,
        user_ids: &[Uuid],
        draft: &NotificationDraft,
    ) -> Result<Vec<Notification>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "INSERT INTO notifications (id, user_id, kind, title, body, order_id)
             SELECT gen_random_uuid(), u, $2, $3, $4, $5 FROM UNNEST($1::uuid[]) AS u
             RETURNING {}",
            NOTIFICATION_COLUMNS
        );
        let rows = sqlx::query_as::<_, Notification>(&sql)
            .bind(user_ids)
            .bind(draft.kind)
            .bind(&draft.title)
            .bind(&draft.body)
            .bind(draft.order_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Active executors whose specializations (and region, when they set
    /// one) match a newly published order.
    pub async fn matching_executors(&self, order: &Order) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM users
             WHERE role = 'EXECUTOR' AND status = 'ACTIVE'
               AND $1 = ANY(specializations)
               AND (region IS NULL OR region = '' OR region = $2)",
        )
        .bind(order.category)
        .bind(&order.region)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Active users, optionally of one role. Used by admin broadcasts.
    pub async fn active_user_ids(&self, role: Option<UserRole>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM users
             WHERE status = 'ACTIVE' AND ($1::user_role IS NULL OR role = $1)",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        page: Pagination,
    ) -> Result<NotificationPage> {
        let (total, unread) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*) FILTER (WHERE $2 = FALSE OR is_read = FALSE),
                    COUNT(*) FILTER (WHERE is_read = FALSE)
             FROM notifications WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(unread_only)
        .fetch_one(&self.pool)
        .await?;
        let sql = format!(
            "SELECT {} FROM notifications
             WHERE user_id = $1 AND ($2 = FALSE OR is_read = FALSE)
             ORDER BY created_at DESC, id
             LIMIT $3 OFFSET $4",
            NOTIFICATION_COLUMNS
        );
        let notifications = sqlx::query_as::<_, Notification>(&sql)
            .bind(user_id)
            .bind(unread_only)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        Ok(NotificationPage {
            notifications,
            total,
            unread,
        })
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mark one of the user's notifications read. `false` if it is not theirs.
    pub async fn mark_notification_read(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_notification(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
