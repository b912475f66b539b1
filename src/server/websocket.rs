//! WebSocket handler: order chat rooms, typing indicators, read receipts,
//! presence and pushed notifications.
//!
//! The token is checked before the upgrade, from `?token=` or the
//! `Authorization` header, so unauthenticated clients get a plain 401.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::middleware_auth::{authenticate, load_active_user};
use super::routes_messages::{ensure_chat_access, mark_read, post_message};
use super::AppState;
use crate::chat::{ClientEvent, ConnId, ServerEvent};
use crate::db::messages::NewMessage;
use crate::db::users::User;

#[derive(Debug, Default, Deserialize)]
pub(super) struct WsParams {
    token: Option<String>,
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

pub(super) async fn handler_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let token = params
        .token
        .or_else(|| header_token(&headers))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let user = authenticate(&state, &token).await?;
    Ok(ws.on_upgrade(move |socket| ws_loop(socket, state, user)))
}

async fn ws_loop(mut socket: WebSocket, state: Arc<AppState>, user: User) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (conn, came_online) = state.hub.connect(user.id, tx);
    state.prom_metrics.ws_connections.inc();
    if came_online {
        state.prom_metrics.online_users.inc();
        state
            .hub
            .broadcast_presence(user.id, &ServerEvent::UserOnline { user_id: user.id });
    }
    info!(user_id = %user.id, conn, "socket connected");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Flow::Close(event) = handle_frame(&state, user.id, conn, text.as_str()).await {
                            if let Some(frame) = event.encode() {
                                let _ = socket.send(WsMessage::Text(frame.into())).await;
                            }
                            let _ = socket.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.prom_metrics.ws_connections.dec();
    if let Some(departure) = state.hub.disconnect(conn) {
        for order_id in &departure.rooms {
            state.hub.broadcast(
                *order_id,
                &ServerEvent::UserTyping {
                    order_id: *order_id,
                    user_id: user.id,
                    typing: false,
                },
                None,
            );
        }
        if departure.went_offline {
            state.prom_metrics.online_users.dec();
            state
                .hub
                .broadcast_presence(user.id, &ServerEvent::UserOffline { user_id: user.id });
        }
    }
    info!(user_id = %user.id, conn, "socket disconnected");
}

/// What the socket loop does after a frame.
#[derive(Debug)]
enum Flow {
    Continue,
    /// The account lost access: send the event, then close.
    Close(ServerEvent),
}

/// Parse and dispatch one client frame; failures go back to the sender as
/// an `error` event. The account is re-read first so a block takes effect
/// on an open socket.
async fn handle_frame(state: &AppState, user_id: Uuid, conn: ConnId, text: &str) -> Flow {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn, error = %e, "unparseable socket frame");
            state
                .hub
                .send_to_conn(conn, &ServerEvent::error("Unknown or malformed event"));
            return Flow::Continue;
        }
    };
    let user = match load_active_user(state, user_id).await {
        Ok(user) => user,
        Err(ApiError::Internal(inner)) => {
            error!(conn, error = %inner, "failed to reload socket user");
            state
                .hub
                .send_to_conn(conn, &ServerEvent::error("Internal server error"));
            return Flow::Continue;
        }
        Err(denied) => {
            info!(%user_id, conn, reason = %denied, "closing socket of inactive account");
            return Flow::Close(ServerEvent::error(denied.to_string()));
        }
    };
    if let Err(e) = dispatch(state, &user, conn, event).await {
        let message = match e {
            ApiError::Internal(ref inner) => {
                error!(conn, error = %inner, "socket event failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        state.hub.send_to_conn(conn, &ServerEvent::error(message));
    }
    Flow::Continue
}

async fn dispatch(state: &AppState, user: &User, conn: ConnId, event: ClientEvent) -> ApiResult<()> {
    match event {
        ClientEvent::JoinOrder { order_id } => {
            ensure_chat_access(state, user, order_id).await?;
            let online = state
                .hub
                .join(conn, order_id)
                .ok_or_else(|| ApiError::validation("Connection closed"))?;
            state
                .hub
                .send_to_conn(conn, &ServerEvent::Joined { order_id, online });
        }
        ClientEvent::LeaveOrder { order_id } => {
            state.hub.leave(conn, order_id);
        }
        ClientEvent::SendMessage {
            order_id,
            content,
            file_url,
            file_name,
        } => {
            let order = ensure_chat_access(state, user, order_id).await?;
            let new = NewMessage {
                content,
                file_url,
                file_name,
            };
            let message = post_message(state, user, &order, new, Some(conn)).await?;
            // The sender may not have joined the room; echo so it sees the stored row.
            state
                .hub
                .send_to_conn(conn, &ServerEvent::NewMessage { message });
        }
        ClientEvent::Typing { order_id } => typing(state, user, conn, order_id, true),
        ClientEvent::StopTyping { order_id } => typing(state, user, conn, order_id, false),
        ClientEvent::MarkRead { order_id } => {
            ensure_chat_access(state, user, order_id).await?;
            mark_read(state, user, order_id, Some(conn)).await?;
        }
    }
    Ok(())
}

/// Typing indicators only reach a room the sender has joined.
fn typing(state: &AppState, user: &User, conn: ConnId, order_id: Uuid, typing: bool) {
    if state.hub.in_room(conn, order_id) {
        state.hub.broadcast(
            order_id,
            &ServerEvent::UserTyping {
                order_id,
                user_id: user.id,
                typing,
            },
            Some(conn),
        );
    }
}
