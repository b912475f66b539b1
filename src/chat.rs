//! # Chat Hub: Rooms, Presence and Push
//!
//! In-process registry of live WebSocket connections. Each connection owns an
//! unbounded queue drained by its socket writer task; the hub only enqueues
//! already-serialised frames, so the lock is never held across `.await`.
//!
//! - Rooms: order id → connections that joined the order's chat.
//! - Presence: user id → number of open connections. A user goes online with
//!   the first connection and offline when the last one closes.
//!
//! Delivery is best effort. A frame queued to a connection whose writer has
//! gone away is dropped silently; the connection is removed on disconnect.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::db::messages::Message;
use crate::db::notifications::Notification;

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type ConnId = u64;

/// Frames sent by the browser, as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinOrder {
        order_id: Uuid,
    },
    LeaveOrder {
        order_id: Uuid,
    },
    SendMessage {
        order_id: Uuid,
        #[serde(default)]
        content: String,
        file_url: Option<String>,
        file_name: Option<String>,
    },
    Typing {
        order_id: Uuid,
    },
    StopTyping {
        order_id: Uuid,
    },
    MarkRead {
        order_id: Uuid,
    },
}

/// Frames pushed to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined {
        order_id: Uuid,
        online: Vec<Uuid>,
    },
    NewMessage {
        message: Message,
    },
    UserTyping {
        order_id: Uuid,
        user_id: Uuid,
        typing: bool,
    },
    MessagesRead {
        order_id: Uuid,
        user_id: Uuid,
        count: u64,
    },
    UserOnline {
        user_id: Uuid,
    },
    UserOffline {
        user_id: Uuid,
    },
    Notification(Notification),
    Error {
        error: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: message.into(),
        }
    }

    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

struct Connection {
    user_id: Uuid,
    tx: UnboundedSender<String>,
    rooms: HashSet<Uuid>,
}

#[derive(Default)]
struct HubState {
    conns: HashMap<ConnId, Connection>,
    rooms: HashMap<Uuid, HashSet<ConnId>>,
    online: HashMap<Uuid, usize>,
}

impl HubState {
    fn leave(&mut self, conn: ConnId, order_id: Uuid) -> bool {
        let Some(members) = self.rooms.get_mut(&order_id) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.rooms.remove(&order_id);
        }
        if let Some(c) = self.conns.get_mut(&conn) {
            c.rooms.remove(&order_id);
        }
        removed
    }
}

/// What changed when a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: Uuid,
    /// The user has no connections left.
    pub went_offline: bool,
    pub rooms: Vec<Uuid>,
}

#[derive(Default)]
pub struct ChatHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Returns its id and whether the user just came online.
    pub fn connect(&self, user_id: Uuid, tx: UnboundedSender<String>) -> (ConnId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = lock_or_recover(&self.state);
        state.conns.insert(
            id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        let count = state.online.entry(user_id).or_insert(0);
        *count += 1;
        (id, *count == 1)
    }

    pub fn disconnect(&self, conn: ConnId) -> Option<Departure> {
        let mut state = lock_or_recover(&self.state);
        let connection = state.conns.remove(&conn)?;
        let rooms: Vec<Uuid> = connection.rooms.iter().copied().collect();
        for order_id in &rooms {
            if let Some(members) = state.rooms.get_mut(order_id) {
                members.remove(&conn);
                if members.is_empty() {
                    state.rooms.remove(order_id);
                }
            }
        }
        let went_offline = match state.online.get_mut(&connection.user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                state.online.remove(&connection.user_id);
                true
            }
        };
        Some(Departure {
            user_id: connection.user_id,
            went_offline,
            rooms,
        })
    }

    /// Add a connection to an order room. Returns the distinct users now in
    /// the room, or `None` for an unknown connection.
    pub fn join(&self, conn: ConnId, order_id: Uuid) -> Option<Vec<Uuid>> {
        let mut state = lock_or_recover(&self.state);
        state.conns.get_mut(&conn)?.rooms.insert(order_id);
        state.rooms.entry(order_id).or_default().insert(conn);
        Some(users_in(&state, order_id).into_iter().collect())
    }

    pub fn leave(&self, conn: ConnId, order_id: Uuid) -> bool {
        lock_or_recover(&self.state).leave(conn, order_id)
    }

    pub fn in_room(&self, conn: ConnId, order_id: Uuid) -> bool {
        lock_or_recover(&self.state)
            .rooms
            .get(&order_id)
            .is_some_and(|m| m.contains(&conn))
    }

    /// Distinct users with at least one connection in the room.
    pub fn users_in_room(&self, order_id: Uuid) -> HashSet<Uuid> {
        users_in(&lock_or_recover(&self.state), order_id)
    }

    /// Push to every connection in a room, optionally skipping one.
    /// Returns the number of frames queued.
    pub fn broadcast(&self, order_id: Uuid, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let Some(frame) = event.encode() else {
            return 0;
        };
        let state = lock_or_recover(&self.state);
        let Some(members) = state.rooms.get(&order_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| state.conns.get(id))
            .filter(|c| c.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Push to every open connection of one user.
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let Some(frame) = event.encode() else {
            return 0;
        };
        let state = lock_or_recover(&self.state);
        state
            .conns
            .values()
            .filter(|c| c.user_id == user_id)
            .filter(|c| c.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Push to one connection.
    pub fn send_to_conn(&self, conn: ConnId, event: &ServerEvent) -> bool {
        let Some(frame) = event.encode() else {
            return false;
        };
        lock_or_recover(&self.state)
            .conns
            .get(&conn)
            .is_some_and(|c| c.tx.send(frame).is_ok())
    }

    /// Push to every connection except those of `user_id`.
    pub fn broadcast_presence(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let Some(frame) = event.encode() else {
            return 0;
        };
        let state = lock_or_recover(&self.state);
        state
            .conns
            .values()
            .filter(|c| c.user_id != user_id)
            .filter(|c| c.tx.send(frame.clone()).is_ok())
            .count()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        lock_or_recover(&self.state).online.contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        lock_or_recover(&self.state).conns.len()
    }
}

fn users_in(state: &HubState, order_id: Uuid) -> HashSet<Uuid> {
    state
        .rooms
        .get(&order_id)
        .map(|members| {
            members
                .iter()
                .filter_map(|id| state.conns.get(id).map(|c| c.user_id))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[test]
    fn presence_tracks_first_and_last_connection() {
        let hub = ChatHub::new();
        let user = Uuid::new_v4();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();

        let (c1, first) = hub.connect(user, tx1);
        assert!(first);
        let (c2, first) = hub.connect(user, tx2);
        assert!(!first);
        assert!(hub.is_online(user));

        let d = hub.disconnect(c1).unwrap();
        assert!(!d.went_offline);
        assert!(hub.is_online(user));

        let d = hub.disconnect(c2).unwrap();
        assert!(d.went_offline);
        assert!(!hub.is_online(user));
        assert!(hub.disconnect(c2).is_none());
    }

    #[test]
    fn broadcast_reaches_room_members_except_sender() {
        let hub = ChatHub::new();
        let order = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let (tx_c, mut rx_c) = unbounded_channel();
        let (ca, _) = hub.connect(alice, tx_a);
        let (cb, _) = hub.connect(bob, tx_b);
        let (_cc, _) = hub.connect(carol, tx_c);

        hub.join(ca, order).unwrap();
        let online = hub.join(cb, order).unwrap();
        assert_eq!(online.len(), 2);

        let event = ServerEvent::UserTyping {
            order_id: order,
            user_id: alice,
            typing: true,
        };
        assert_eq!(hub.broadcast(order, &event, Some(ca)), 1);

        assert!(drain(&mut rx_a).is_empty());
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["event"], "user-typing");
        assert_eq!(got[0]["data"]["typing"], true);
        assert!(drain(&mut rx_c).is_empty(), "carol never joined");
    }

    #[test]
    fn leave_and_disconnect_clean_up_rooms() {
        let hub = ChatHub::new();
        let order = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (tx, _rx) = unbounded_channel();
        let (conn, _) = hub.connect(user, tx);

        hub.join(conn, order).unwrap();
        assert!(hub.in_room(conn, order));
        assert!(hub.leave(conn, order));
        assert!(!hub.leave(conn, order));
        assert!(hub.users_in_room(order).is_empty());

        hub.join(conn, order).unwrap();
        let d = hub.disconnect(conn).unwrap();
        assert_eq!(d.rooms, vec![order]);
        assert!(hub.users_in_room(order).is_empty());
        assert_eq!(hub.broadcast(order, &ServerEvent::error("x"), None), 0);
    }

    #[test]
    fn join_unknown_connection_is_rejected() {
        let hub = ChatHub::new();
        assert!(hub.join(42, Uuid::new_v4()).is_none());
    }

    #[test]
    fn send_to_user_hits_every_tab() {
        let hub = ChatHub::new();
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        hub.connect(user, tx1);
        hub.connect(user, tx2);
        assert_eq!(hub.send_to_user(user, &ServerEvent::error("boom")), 2);
        assert_eq!(drain(&mut rx1)[0]["data"]["error"], "boom");
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[test]
    fn presence_broadcast_skips_the_user() {
        let hub = ChatHub::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        hub.connect(alice, tx_a);
        hub.connect(bob, tx_b);
        hub.broadcast_presence(alice, &ServerEvent::UserOnline { user_id: alice });
        assert!(drain(&mut rx_a).is_empty());
        let got = drain(&mut rx_b);
        assert_eq!(got[0]["event"], "user-online");
        assert_eq!(got[0]["data"]["user_id"], alice.to_string());
    }

    #[test]
    fn dropped_receiver_does_not_count() {
        let hub = ChatHub::new();
        let order = Uuid::new_v4();
        let (tx, rx) = unbounded_channel();
        let (conn, _) = hub.connect(Uuid::new_v4(), tx);
        hub.join(conn, order).unwrap();
        drop(rx);
        assert_eq!(hub.broadcast(order, &ServerEvent::error("gone"), None), 0);
    }

    #[test]
    fn client_events_parse_from_envelope() {
        let order = Uuid::new_v4();
        let raw = format!(
            r#"{{"event":"send-message","data":{{"order_id":"{}","content":"Привет"}}}}"#,
            order
        );
        let parsed: ClientEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            parsed,
            ClientEvent::SendMessage {
                order_id: order,
                content: "Привет".into(),
                file_url: None,
                file_name: None,
            }
        );
        let raw = format!(r#"{{"event":"stop-typing","data":{{"order_id":"{}"}}}}"#, order);
        assert_eq!(
            serde_json::from_str::<ClientEvent>(&raw).unwrap(),
            ClientEvent::StopTyping { order_id: order }
        );
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"explode","data":{}}"#).is_err());
    }
}
