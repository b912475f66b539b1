//! Reviews: eligibility, creation, moderation and rating aggregation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::orders::{Order, OrderStatus};
use super::{Database, Pagination};

pub const MIN_RATING: i16 = 1;
pub const MAX_RATING: i16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "review_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Pending => write!(f, "PENDING"),
            ReviewStatus::Approved => write!(f, "APPROVED"),
            ReviewStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Review {
    pub id: Uuid,
    pub order_id: Uuid,
    pub reviewer_id: Uuid,
    pub reviewee_id: Uuid,
    pub rating: i16,
    pub comment: Option<String>,
    pub status: ReviewStatus,
    pub moderated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Review with the author's display fields, for public listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReviewWithAuthor {
    pub id: Uuid,
    pub order_id: Uuid,
    pub reviewer_id: Uuid,
    pub reviewee_id: Uuid,
    pub rating: i16,
    pub comment: Option<String>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub reviewer_name: String,
    pub reviewer_avatar_url: Option<String>,
    pub order_title: String,
}

/// Why a user cannot review an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    NotCompleted,
    NotParticipant,
    NoExecutor,
    AlreadyReviewed,
}

impl Ineligible {
    pub fn message(self) -> &'static str {
        match self {
            Ineligible::NotCompleted => "Only completed orders can be reviewed",
            Ineligible::NotParticipant => "Only the customer or the executor can review this order",
            Ineligible::NoExecutor => "Order has no executor to review",
            Ineligible::AlreadyReviewed => "You have already reviewed this order",
        }
    }
}

/// Determine who `reviewer_id` would review on `order`.
///
/// The customer reviews the executor and the executor reviews the
/// customer. Archived orders stay reviewable if they were completed.
pub fn review_target(order: &Order, reviewer_id: Uuid) -> Result<Uuid, Ineligible> {
    let completed = order.status == OrderStatus::Completed
        || (order.status == OrderStatus::Archived && order.completed_at.is_some());
    if !completed {
        return Err(Ineligible::NotCompleted);
    }
    let executor_id = order.executor_id.ok_or(Ineligible::NoExecutor)?;
    if reviewer_id == order.customer_id {
        Ok(executor_id)
    } else if reviewer_id == executor_id {
        Ok(order.customer_id)
    } else {
        Err(Ineligible::NotParticipant)
    }
}

const REVIEW_COLUMNS: &str =
    "id, order_id, reviewer_id, reviewee_id, rating, comment, status, moderated_at, created_at";

impl Database {
    /// Insert a PENDING review. Returns `None` if this reviewer already
    /// reviewed the order.
    pub async fn create_review(
        &self,
        order_id: Uuid,
        reviewer_id: Uuid,
        reviewee_id: Uuid,
        rating: i16,
        comment: Option<&str>,
    ) -> Result<Option<Review>> {
        let sql = format!(
            "INSERT INTO reviews (id, order_id, reviewer_id, reviewee_id, rating, comment)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (order_id, reviewer_id) DO NOTHING
             RETURNING {}",
            REVIEW_COLUMNS
        );
        let row = sqlx::query_as::<_, Review>(&sql)
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(reviewer_id)
            .bind(reviewee_id)
            .bind(rating)
            .bind(comment)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn has_reviewed(&self, order_id: Uuid, reviewer_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM reviews WHERE order_id = $1 AND reviewer_id = $2)",
        )
        .bind(order_id)
        .bind(reviewer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn get_review(&self, id: Uuid) -> Result<Option<Review>> {
        let sql = format!("SELECT {} FROM reviews WHERE id = $1", REVIEW_COLUMNS);
        let row = sqlx::query_as::<_, Review>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Approved reviews about a user, newest first.
    pub async fn list_reviews_about(
        &self,
        reviewee_id: Uuid,
        page: Pagination,
    ) -> Result<(Vec<ReviewWithAuthor>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reviews WHERE reviewee_id = $1 AND status = 'APPROVED'",
        )
        .bind(reviewee_id)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query_as::<_, ReviewWithAuthor>(
            "SELECT r.id, r.order_id, r.reviewer_id, r.reviewee_id, r.rating, r.comment,
                    r.status, r.created_at, u.name AS reviewer_name,
                    u.avatar_url AS reviewer_avatar_url, o.title AS order_title
             FROM reviews r
             JOIN users u ON u.id = r.reviewer_id
             JOIN orders o ON o.id = r.order_id
             WHERE r.reviewee_id = $1 AND r.status = 'APPROVED'
             ORDER BY r.created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(reviewee_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    /// Reviews written by a user, any status.
    pub async fn list_reviews_by(&self, reviewer_id: Uuid) -> Result<Vec<Review>> {
        let sql = format!(
            "SELECT {} FROM reviews WHERE reviewer_id = $1 ORDER BY created_at DESC",
            REVIEW_COLUMNS
        );
        let rows = sqlx::query_as::<_, Review>(&sql)
            .bind(reviewer_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Moderation queue and history for admins.
    pub async fn list_reviews_admin(
        &self,
        status: Option<ReviewStatus>,
        page: Pagination,
    ) -> Result<(Vec<ReviewWithAuthor>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reviews WHERE $1::review_status IS NULL OR status = $1",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query_as::<_, ReviewWithAuthor>(
            "SELECT r.id, r.order_id, r.reviewer_id, r.reviewee_id, r.rating, r.comment,
                    r.status, r.created_at, u.name AS reviewer_name,
                    u.avatar_url AS reviewer_avatar_url, o.title AS order_title
             FROM reviews r
             JOIN users u ON u.id = r.reviewer_id
             JOIN orders o ON o.id = r.order_id
             WHERE $1::review_status IS NULL OR r.status = $1
             ORDER BY r.created_at ASC
             LIMIT $2 OFFSET $3",
        )
        .bind(status)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    /// Set a review's moderation status and refresh the reviewee's rating.
    ///
    /// Returns the updated review and its previous status.
    pub async fn moderate_review(
        &self,
        id: Uuid,
        status: ReviewStatus,
    ) -> Result<Option<(Review, ReviewStatus)>> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, ReviewStatus>(
            "SELECT status FROM reviews WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(previous) = previous else {
            return Ok(None);
        };

        let sql = format!(
            "UPDATE reviews SET status = $2, moderated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            REVIEW_COLUMNS
        );
        let review = sqlx::query_as::<_, Review>(&sql)
            .bind(id)
            .bind(status)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE users SET
               rating = COALESCE((SELECT AVG(rating)::float8 FROM reviews
                                  WHERE reviewee_id = $1 AND status = 'APPROVED'), 0),
               reviews_count = (SELECT COUNT(*)::int FROM reviews
                                WHERE reviewee_id = $1 AND status = 'APPROVED'),
               updated_at = NOW()
             WHERE id = $1",
        )
        .bind(review.reviewee_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((review, previous)))
    }
}
