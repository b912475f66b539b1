//! Order chat over REST. The WebSocket handler shares [`post_message`] and
//! [`mark_read`] so both transports broadcast the same events.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiQuery, ApiResult};
use super::middleware_auth::RequireAuth;
use super::routes_orders::load_order;
use super::AppState;
use crate::chat::{ConnId, ServerEvent};
use crate::db::messages::{Message, NewMessage};
use crate::db::orders::Order;
use crate::db::users::User;
use crate::notify::drafts;

const DEFAULT_HISTORY: i64 = 50;
const MAX_HISTORY: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub(super) struct HistoryQuery {
    before: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

impl HistoryQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY)
    }
}

#[derive(Deserialize)]
pub(super) struct SendPayload {
    #[serde(default)]
    content: String,
    file_url: Option<String>,
    file_name: Option<String>,
}

/// Load an order and check `user` may read and write its chat.
pub(super) async fn ensure_chat_access(
    state: &AppState,
    user: &User,
    order_id: Uuid,
) -> ApiResult<Order> {
    let order = load_order(state, order_id).await?;
    if user.is_admin() || order.is_party(user.id) {
        return Ok(order);
    }
    if state.db.has_responded(order.id, user.id).await? {
        return Ok(order);
    }
    Err(ApiError::forbidden("You are not a participant of this chat"))
}

/// Store a message, push it to the room and notify participants who are
/// not watching the room.
pub(super) async fn post_message(
    state: &AppState,
    sender: &User,
    order: &Order,
    new: NewMessage,
    from_conn: Option<ConnId>,
) -> ApiResult<Message> {
    let new = new.validate().map_err(ApiError::validation)?;
    let message = state.db.insert_message(order.id, sender.id, &new).await?;

    state.hub.broadcast(
        order.id,
        &ServerEvent::NewMessage {
            message: message.clone(),
        },
        from_conn,
    );

    let watching = state.hub.users_in_room(order.id);
    let absent: Vec<Uuid> = state
        .db
        .chat_participants(order.id)
        .await?
        .into_iter()
        .filter(|id| *id != sender.id && !watching.contains(id))
        .collect();
    if !absent.is_empty() {
        state
            .notifier
            .notify_many(&absent, drafts::new_message(order, &sender.name))
            .await;
    }
    Ok(message)
}

/// Mark the other side's messages read and tell the room.
pub(super) async fn mark_read(
    state: &AppState,
    reader: &User,
    order_id: Uuid,
    from_conn: Option<ConnId>,
) -> ApiResult<u64> {
    let count = state.db.mark_messages_read(order_id, reader.id).await?;
    if count > 0 {
        state.hub.broadcast(
            order_id,
            &ServerEvent::MessagesRead {
                order_id,
                user_id: reader.id,
                count,
            },
            from_conn,
        );
    }
    Ok(count)
}

pub(super) async fn handler_messages_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let order = ensure_chat_access(&state, &user, id).await?;
    let messages = state
        .db
        .list_messages(order.id, query.before, query.limit())
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

pub(super) async fn handler_message_send(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    ApiJson(payload): ApiJson<SendPayload>,
) -> ApiResult<impl IntoResponse> {
    let order = ensure_chat_access(&state, &user, id).await?;
    let new = NewMessage {
        content: payload.content,
        file_url: payload.file_url,
        file_name: payload.file_name,
    };
    let message = post_message(&state, &user, &order, new, None).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(super) async fn handler_messages_read(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let order = ensure_chat_access(&state, &user, id).await?;
    let count = mark_read(&state, &user, order.id, None).await?;
    Ok(Json(json!({ "count": count })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(HistoryQuery::default().limit(), 50);
        let q = HistoryQuery {
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(q.limit(), 100);
        let q = HistoryQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1);
    }
}
