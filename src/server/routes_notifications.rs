//! The caller's notification feed.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ApiQuery, ApiResult};
use super::middleware_auth::RequireAuth;
use super::AppState;
use crate::db::notifications::{NotificationPage, NotificationQuery};

pub(super) async fn handler_notifications_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiQuery(query): ApiQuery<NotificationQuery>,
) -> ApiResult<Json<NotificationPage>> {
    let page = state
        .db
        .list_notifications(user.id, query.unread_only, query.pagination())
        .await?;
    Ok(Json(page))
}

pub(super) async fn handler_unread_count(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
) -> ApiResult<Json<serde_json::Value>> {
    let count = state.db.unread_count(user.id).await?;
    Ok(Json(json!({ "count": count })))
}

pub(super) async fn handler_notification_read(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.mark_notification_read(user.id, id).await? {
        return Err(ApiError::not_found("Notification not found"));
    }
    Ok(Json(json!({ "message": "Marked as read" })))
}

pub(super) async fn handler_read_all(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
) -> ApiResult<Json<serde_json::Value>> {
    let count = state.db.mark_all_notifications_read(user.id).await?;
    Ok(Json(json!({ "count": count })))
}

pub(super) async fn handler_notification_delete(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.delete_notification(user.id, id).await? {
        return Err(ApiError::not_found("Notification not found"));
    }
    Ok(Json(json!({ "message": "Notification deleted" })))
}
