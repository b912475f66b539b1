//! Admin panel API: statistics, account management, review moderation,
//! payment audit and broadcast notifications.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiQuery, ApiResult};
use super::middleware_auth::RequireAdmin;
use super::routes_orders::{OrderList, OrderListQuery};
use super::{AppState, Page};
use crate::db::admin::AdminStats;
use crate::db::orders::OrderScope;
use crate::db::payments::{Payment, PaymentFilter, PaymentPurpose, PaymentStatus};
use crate::db::reviews::{Review, ReviewStatus, ReviewWithAuthor};
use crate::db::users::{AdminUserUpdate, User, UserFilter, UserRole, UserStatus};
use crate::db::Pagination;
use crate::notify::drafts;

const MAX_BROADCAST_TITLE_LEN: usize = 200;
const MAX_BROADCAST_BODY_LEN: usize = 2000;

#[derive(Debug, Default, Deserialize)]
pub(super) struct UserListQuery {
    role: Option<UserRole>,
    status: Option<UserStatus>,
    search: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ReviewListQuery {
    status: Option<ReviewStatus>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PaymentListQuery {
    status: Option<PaymentStatus>,
    purpose: Option<PaymentPurpose>,
    user_id: Option<Uuid>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(super) struct ModeratePayload {
    status: ReviewStatus,
}

#[derive(Deserialize)]
pub(super) struct BroadcastPayload {
    title: String,
    body: String,
    role: Option<UserRole>,
}

#[derive(Serialize)]
pub(super) struct UserList {
    users: Vec<User>,
}

#[derive(Serialize)]
pub(super) struct ReviewList {
    reviews: Vec<ReviewWithAuthor>,
}

#[derive(Serialize)]
pub(super) struct PaymentList {
    payments: Vec<Payment>,
}

pub(super) async fn handler_stats(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
) -> ApiResult<Json<AdminStats>> {
    Ok(Json(state.db.admin_stats().await?))
}

pub(super) async fn handler_users_list(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    ApiQuery(query): ApiQuery<UserListQuery>,
) -> ApiResult<Json<Page<UserList>>> {
    let filter = UserFilter {
        role: query.role,
        status: query.status,
        search: query.search,
    };
    let page = Pagination {
        page: query.page,
        limit: query.limit,
    };
    let (users, total) = state.db.list_users(&filter, page).await?;
    Ok(Json(Page::new(UserList { users }, total, page)))
}

/// Reject updates an admin must not apply to their own account.
fn check_self_update(admin_id: Uuid, target: Uuid, update: &AdminUserUpdate) -> ApiResult<()> {
    if admin_id != target {
        return Ok(());
    }
    if update.status.is_some_and(|s| s != UserStatus::Active) {
        return Err(ApiError::validation("You cannot block your own account"));
    }
    if update.role.is_some_and(|r| r != UserRole::Admin) {
        return Err(ApiError::validation("You cannot change your own role"));
    }
    Ok(())
}

pub(super) async fn handler_user_update(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<Uuid>,
    ApiJson(update): ApiJson<AdminUserUpdate>,
) -> ApiResult<Json<User>> {
    check_self_update(admin.id, id, &update)?;
    let before = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let user = state
        .db
        .admin_update_user(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    info!(
        admin_id = %admin.id,
        user_id = %user.id,
        status = %user.status,
        role = %user.role,
        balance_delta = update.balance_delta,
        bonus_delta = update.bonus_delta,
        "user updated by admin"
    );
    if user.status != before.status {
        state
            .notifier
            .notify(user.id, drafts::account_status(user.status))
            .await;
    }
    Ok(Json(user))
}

pub(super) async fn handler_user_delete(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if admin.id == id {
        return Err(ApiError::validation("You cannot delete your own account"));
    }
    if !state.db.delete_user(id).await? {
        return Err(ApiError::not_found("User not found"));
    }
    info!(admin_id = %admin.id, user_id = %id, "user deleted");
    Ok(Json(json!({ "message": "User deleted" })))
}

pub(super) async fn handler_orders_list(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    ApiQuery(query): ApiQuery<OrderListQuery>,
) -> ApiResult<Json<Page<OrderList>>> {
    let (filter, page) = query.split();
    let (orders, total) = state
        .db
        .list_orders(&OrderScope::All, &filter, page)
        .await?;
    Ok(Json(Page::new(OrderList { orders }, total, page)))
}

pub(super) async fn handler_reviews_list(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    ApiQuery(query): ApiQuery<ReviewListQuery>,
) -> ApiResult<Json<Page<ReviewList>>> {
    let page = Pagination {
        page: query.page,
        limit: query.limit,
    };
    let (reviews, total) = state.db.list_reviews_admin(query.status, page).await?;
    Ok(Json(Page::new(ReviewList { reviews }, total, page)))
}

pub(super) async fn handler_review_moderate(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<Uuid>,
    ApiJson(payload): ApiJson<ModeratePayload>,
) -> ApiResult<Json<Review>> {
    if payload.status == ReviewStatus::Pending {
        return Err(ApiError::validation("Status must be APPROVED or REJECTED"));
    }
    let (review, previous) = state
        .db
        .moderate_review(id, payload.status)
        .await?
        .ok_or_else(|| ApiError::not_found("Review not found"))?;
    info!(admin_id = %admin.id, review_id = %review.id, status = %review.status, "review moderated");

    if previous != review.status {
        state
            .notifier
            .notify(
                review.reviewer_id,
                drafts::review_moderated(review.status, review.order_id),
            )
            .await;
        if review.status == ReviewStatus::Approved {
            state
                .notifier
                .notify(
                    review.reviewee_id,
                    drafts::new_review(review.rating, review.order_id),
                )
                .await;
        }
    }
    Ok(Json(review))
}

pub(super) async fn handler_payments_list(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    ApiQuery(query): ApiQuery<PaymentListQuery>,
) -> ApiResult<Json<Page<PaymentList>>> {
    let filter = PaymentFilter {
        status: query.status,
        purpose: query.purpose,
        user_id: query.user_id,
    };
    let page = Pagination {
        page: query.page,
        limit: query.limit,
    };
    let (payments, total) = state.db.list_payments(&filter, page).await?;
    Ok(Json(Page::new(PaymentList { payments }, total, page)))
}

fn validate_broadcast(payload: &BroadcastPayload) -> ApiResult<(String, String)> {
    let title = payload.title.trim();
    let body = payload.body.trim();
    if title.is_empty() || body.is_empty() {
        return Err(ApiError::validation("Title and body are required"));
    }
    if title.chars().count() > MAX_BROADCAST_TITLE_LEN
        || body.chars().count() > MAX_BROADCAST_BODY_LEN
    {
        return Err(ApiError::validation("Broadcast is too long"));
    }
    Ok((title.to_string(), body.to_string()))
}

pub(super) async fn handler_broadcast(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    ApiJson(payload): ApiJson<BroadcastPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let (title, body) = validate_broadcast(&payload)?;
    let recipients = state.db.active_user_ids(payload.role).await?;
    let sent = state
        .notifier
        .notify_many(&recipients, drafts::system(&title, &body))
        .await;
    info!(admin_id = %admin.id, role = ?payload.role, sent, "broadcast sent");
    Ok(Json(json!({ "sent": sent })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_cannot_block_or_demote_self() {
        let id = Uuid::new_v4();
        let block = AdminUserUpdate {
            status: Some(UserStatus::Blocked),
            ..Default::default()
        };
        assert!(check_self_update(id, id, &block).is_err());
        assert!(check_self_update(id, Uuid::new_v4(), &block).is_ok());

        let demote = AdminUserUpdate {
            role: Some(UserRole::Customer),
            ..Default::default()
        };
        assert!(check_self_update(id, id, &demote).is_err());

        let bonus = AdminUserUpdate {
            bonus_delta: 500,
            ..Default::default()
        };
        assert!(check_self_update(id, id, &bonus).is_ok());
    }

    #[test]
    fn broadcast_requires_text() {
        let blank = BroadcastPayload {
            title: "  ".into(),
            body: "Технические работы".into(),
            role: None,
        };
        assert!(validate_broadcast(&blank).is_err());
        let ok = BroadcastPayload {
            title: " Обновление ".into(),
            body: "Новые категории заказов".into(),
            role: Some(UserRole::Executor),
        };
        assert_eq!(
            validate_broadcast(&ok).unwrap(),
            (
                "Обновление".to_string(),
                "Новые категории заказов".to_string()
            )
        );
    }
}
