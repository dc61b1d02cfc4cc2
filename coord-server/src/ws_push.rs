//! Realtime telemetry push over WebSocket. Subscribers are either watching
//! a single room (player view) or the whole server (admin view); rooms
//! hand their freshly-computed projections to the hub, which fans them out
//! as JSON text frames. The hub never locks a room itself.

use crate::room::RoomView;
use crate::server_state::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use protocol::WS_HEARTBEAT_INTERVAL;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subscription {
    None,
    Room(String),
    Admin,
}

pub struct WsClient {
    pub id: Uuid,
    pub ip: IpAddr,
    /// Taken on close so the forward task drains out and drops the socket.
    tx: Mutex<Option<UnboundedSender<String>>>,
    subscription: Mutex<Subscription>,
    last_active: Mutex<Instant>,
}

impl WsClient {
    fn send_json(&self, value: &serde_json::Value) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(value.to_string());
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[derive(Default)]
pub struct PushHub {
    clients: DashMap<Uuid, Arc<WsClient>>,
}

impl PushHub {
    fn register(&self, ip: IpAddr, tx: UnboundedSender<String>) -> Arc<WsClient> {
        let client = Arc::new(WsClient {
            id: Uuid::new_v4(),
            ip,
            tx: Mutex::new(Some(tx)),
            subscription: Mutex::new(Subscription::None),
            last_active: Mutex::new(Instant::now()),
        });
        self.clients.insert(client.id, Arc::clone(&client));
        client
    }

    fn unregister(&self, id: Uuid) {
        self.clients.remove(&id);
    }

    /// Fans a fresh room projection out to that room's subscribers.
    pub fn room_update(&self, room_id: &str, view: &RoomView) {
        let frame = json!({ "type": "room_update", "data": view });
        self.send_to_room_subscribers(room_id, &frame);
    }

    /// Broadcasts a timestamped log line to a room's subscribers.
    pub fn room_log(&self, room_id: &str, message: &str) {
        let frame = json!({
            "type": "room_log",
            "data": { "time": Utc::now().to_rfc3339(), "message": message },
        });
        self.send_to_room_subscribers(room_id, &frame);
    }

    fn send_to_room_subscribers(&self, room_id: &str, frame: &serde_json::Value) {
        for client in self.clients.iter() {
            let matches = matches!(
                &*client.subscription.lock().unwrap(),
                Subscription::Room(id) if id == room_id
            );
            if matches {
                client.send_json(frame);
            }
        }
    }

    /// Snapshots every room and fans the result out to admin subscribers.
    /// Must not be called while holding any room lock.
    pub async fn admin_update(&self, state: &AppState) {
        let admins: Vec<Arc<WsClient>> = self
            .clients
            .iter()
            .filter(|client| *client.subscription.lock().unwrap() == Subscription::Admin)
            .map(|client| Arc::clone(client.value()))
            .collect();
        if admins.is_empty() {
            return;
        }
        let frame = json!({ "type": "admin_update", "data": admin_snapshot(state).await });
        for admin in admins {
            admin.send_json(&frame);
        }
    }

    /// Heartbeat pass: ping everyone, drop whoever went quiet.
    pub fn sweep(&self) {
        let ping = json!({ "type": "ping" });
        let mut stale = Vec::new();
        for client in self.clients.iter() {
            if client.last_active.lock().unwrap().elapsed() > WS_HEARTBEAT_INTERVAL {
                stale.push(Arc::clone(client.value()));
            } else {
                client.send_json(&ping);
            }
        }
        for client in stale {
            tracing::debug!(client = %client.id, "push subscriber timed out");
            // Cutting the queue ends the forward task, closing the socket.
            client.close();
            self.clients.remove(&client.id);
        }
    }
}

async fn admin_snapshot(state: &AppState) -> serde_json::Value {
    let rooms: Vec<Arc<crate::room::Room>> = state
        .rooms
        .iter()
        .map(|room| Arc::clone(room.value()))
        .collect();
    let mut views = Vec::with_capacity(rooms.len());
    for room in rooms {
        views.push(room.view().await);
    }
    json!({
        "rooms": views,
        "sessionCount": state.sessions.len(),
        "userCount": state.users.len(),
    })
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsIncoming {
    Subscribe {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Unsubscribe,
    Ping,
    AdminSubscribe {
        token: String,
    },
    AdminUnsubscribe,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr.ip()))
}

/// Splits the socket into a forward task draining the hub queue and a
/// receive loop; whichever finishes first aborts the other.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ip: IpAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client = state.push.register(ip, tx);
    tracing::debug!(client = %client.id, %ip, "push subscriber connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_client = Arc::clone(&client);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                WsMessage::Text(text) => {
                    recv_client.touch();
                    handle_frame(&recv_state, &recv_client, text.as_str()).await;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => recv_client.touch(),
                WsMessage::Close(_) => break,
                WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    state.push.unregister(client.id);
    tracing::debug!(client = %client.id, "push subscriber disconnected");
}

async fn handle_frame(state: &Arc<AppState>, client: &Arc<WsClient>, raw: &str) {
    let incoming: WsIncoming = match serde_json::from_str(raw) {
        Ok(incoming) => incoming,
        Err(_) => {
            client.send_json(&json!({ "type": "error", "message": "malformed message" }));
            return;
        }
    };
    match incoming {
        WsIncoming::Ping => {
            client.send_json(&json!({ "type": "pong" }));
        }
        WsIncoming::Subscribe { room_id } => {
            *client.subscription.lock().unwrap() = Subscription::Room(room_id.clone());
            client.send_json(&json!({ "type": "subscribed", "roomId": room_id }));
            // Hand the newcomer the current picture right away.
            if let Some(room) = state
                .rooms
                .get(&room_id)
                .map(|room| Arc::clone(room.value()))
            {
                let view = room.view().await;
                client.send_json(&json!({ "type": "room_update", "data": view }));
            }
        }
        WsIncoming::Unsubscribe => {
            *client.subscription.lock().unwrap() = Subscription::None;
            client.send_json(&json!({ "type": "unsubscribed" }));
        }
        WsIncoming::AdminSubscribe { token } => {
            if !admin_token_valid(state, &token, client.ip) {
                client.send_json(&json!({ "type": "error", "message": "invalid admin token" }));
                return;
            }
            *client.subscription.lock().unwrap() = Subscription::Admin;
            client.send_json(&json!({ "type": "admin_subscribed" }));
            state.push.admin_update(state).await;
        }
        WsIncoming::AdminUnsubscribe => {
            let mut subscription = client.subscription.lock().unwrap();
            if *subscription == Subscription::Admin {
                *subscription = Subscription::None;
            }
            drop(subscription);
            client.send_json(&json!({ "type": "admin_unsubscribed" }));
        }
    }
}

/// The admin view opens for the permanent token, the read-only view token,
/// or any currently valid OTP-issued temp token.
fn admin_token_valid(state: &AppState, token: &str, ip: IpAddr) -> bool {
    if state.config.admin_token.as_deref() == Some(token) {
        return true;
    }
    if state.config.view_token.as_deref() == Some(token) {
        return true;
    }
    token
        .parse::<Uuid>()
        .is_ok_and(|uuid| state.trust.validate_temp_token(uuid, ip))
}

/// Spawned from `main`: drives the 30 s heartbeat for all subscribers.
pub async fn heartbeat_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        state.push.sweep();
    }
}
