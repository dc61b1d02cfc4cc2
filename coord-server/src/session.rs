//! One session per accepted game socket: version negotiation, the
//! unauthenticated → authenticated handshake, command dispatch, the
//! heartbeat, and connection-lost cleanup.

use crate::connection::{self, Connection};
use crate::room::{Room, RoomError};
use crate::server_state::{AppState, SYSTEM_USER_ID, User};
use protocol::{
    ClientCommand, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, JudgeEvent, Message, ServerCommand,
    TouchFrame,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Delay before welcome chat so it arrives after the auth response has
/// been processed by the client.
const WELCOME_DELAY: Duration = Duration::from_millis(300);

pub struct Session {
    pub id: Uuid,
    pub version: u8,
    pub addr: SocketAddr,
    pub conn: Connection,
    user: RwLock<Option<Arc<User>>>,
    cleaned: AtomicBool,
}

impl Session {
    pub fn user(&self) -> Option<Arc<User>> {
        self.user.read().unwrap().clone()
    }

    pub fn send(&self, cmd: ServerCommand) {
        self.conn.send(cmd);
    }
}

/// Drives a fresh socket: reads the version byte, then spawns the sender,
/// receiver and heartbeat tasks.
pub async fn accept(state: Arc<AppState>, stream: TcpStream, addr: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(?err, "failed to set nodelay");
    }
    let (mut read, write) = stream.into_split();

    // The first byte is the protocol version; it is recorded, not echoed.
    let version = match tokio::time::timeout(HEARTBEAT_TIMEOUT, read.read_u8()).await {
        Ok(Ok(version)) => version,
        _ => {
            tracing::debug!(%addr, "connection dropped before version byte");
            return;
        }
    };

    let (send_tx, send_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
        id: Uuid::new_v4(),
        version,
        addr,
        conn: Connection::new(send_tx),
        user: RwLock::new(None),
        cleaned: AtomicBool::new(false),
    });
    state.sessions.insert(session.id, Arc::clone(&session));
    tracing::info!(
        session = %session.id,
        addr = %session.addr,
        version = session.version,
        "session connected"
    );

    session
        .conn
        .register_task(tokio::spawn(connection::run_sender(write, send_rx)));

    let recv_state = Arc::clone(&state);
    let recv_session = Arc::clone(&session);
    session.conn.register_task(tokio::spawn(async move {
        let mut scratch = Vec::new();
        loop {
            match connection::read_command(&mut read, &mut scratch).await {
                Ok(cmd) => {
                    recv_session.conn.touch();
                    handle_command(&recv_state, &recv_session, cmd).await;
                }
                Err(err) => {
                    tracing::debug!(session = %recv_session.id, %err, "game stream ended");
                    break;
                }
            }
        }
        connection_lost(&recv_state, &recv_session).await;
    }));

    let hb_state = Arc::clone(&state);
    let hb_session = Arc::clone(&session);
    session.conn.register_task(tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if hb_session.conn.idle() > HEARTBEAT_TIMEOUT {
                tracing::info!(session = %hb_session.id, "heartbeat deadline elapsed");
                connection_lost(&hb_state, &hb_session).await;
                return;
            }
        }
    }));
}

/// Connection-lost cleanup: unbind the user, run the room leave protocol
/// if needed, drop the session and close the pipeline. Runs at most once.
pub async fn connection_lost(state: &Arc<AppState>, session: &Arc<Session>) {
    if session.cleaned.swap(true, Ordering::SeqCst) {
        return;
    }
    state.sessions.remove(&session.id);
    let bound_user = session.user.write().unwrap().take();
    if let Some(user) = bound_user {
        // The user may have been rebound to a newer session in the
        // meantime; only the owning session detaches them.
        if user.session_id() == Some(session.id) {
            user.clear_binding();
            if let Some(mut writer) = user.replay.lock().await.take() {
                writer.dispose().await;
            }
            if let Some(room) = user.current_room() {
                room.on_user_leave(state, &user).await;
            }
        }
    }
    session.conn.close();
    tracing::info!(session = %session.id, "session closed");
}

pub async fn handle_command(state: &Arc<AppState>, session: &Arc<Session>, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Ping => session.send(ServerCommand::Pong),
        ClientCommand::Authenticate { token } => authenticate(state, session, &token).await,
        cmd => {
            // Anything else is acted upon only once authenticated;
            // commands from strangers are ignored, not errored.
            let Some(user) = session.user() else {
                return;
            };
            dispatch(state, session, &user, cmd).await;
        }
    }
}

async fn authenticate(state: &Arc<AppState>, session: &Arc<Session>, token: &str) {
    let remote_user = match state.remote.me(token).await {
        Ok(user) => user,
        Err(err) => {
            tracing::info!(session = %session.id, %err, "authentication failed");
            session.send(ServerCommand::Authenticate(Err(err.to_string())));
            return;
        }
    };
    if state.admin_data.is_user_banned(i64::from(remote_user.id)) {
        session.send(ServerCommand::Authenticate(Err(
            "this account is banned".to_owned()
        )));
        return;
    }

    let user = state.intern_user(remote_user.id, &remote_user.name);
    let previous = user.session();
    user.bind_session(session);
    *session.user.write().unwrap() = Some(Arc::clone(&user));
    if let Some(previous) = previous.filter(|previous| previous.id != session.id) {
        // One live session per user: the older pipeline is dropped. Since
        // the user is already rebound, its cleanup skips the room leave.
        tracing::info!(user = user.id, old_session = %previous.id, "user reconnected elsewhere");
        connection_lost(state, &previous).await;
    }

    let room_state = match user.current_room() {
        Some(room) => Some(room.client_room_state(&user).await),
        None => None,
    };
    tracing::info!(session = %session.id, user = user.id, name = %user.name(), "authenticated");
    session.send(ServerCommand::Authenticate(Ok((user.to_info(), room_state))));

    let welcome = state.config.welcome_message.clone();
    if !welcome.is_empty() && state.config.suppress_welcome_for != Some(user.id) {
        let user = Arc::clone(&user);
        tokio::spawn(async move {
            tokio::time::sleep(WELCOME_DELAY).await;
            user.try_send(ServerCommand::Message(Message::Chat {
                user: SYSTEM_USER_ID,
                content: welcome,
            }));
        });
    }
}

fn room_result(res: Result<(), RoomError>) -> Result<(), String> {
    res.map_err(|err| err.to_string())
}

async fn dispatch(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    user: &Arc<User>,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Ping | ClientCommand::Authenticate { .. } => unreachable!(),
        ClientCommand::Chat { message } => {
            let result = match user.current_room() {
                Some(room) => {
                    room.chat(state, user, message).await;
                    Ok(())
                }
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::Chat(result));
        }
        ClientCommand::Touches { frames } => handle_touches(user, frames).await,
        ClientCommand::Judges { judges } => handle_judges(user, judges).await,
        ClientCommand::CreateRoom { id } => create_room(state, session, user, id).await,
        ClientCommand::JoinRoom { id, monitor } => {
            join_room(state, session, user, id, monitor).await;
        }
        ClientCommand::LeaveRoom => {
            let result = match user.current_room() {
                Some(room) => {
                    room.on_user_leave(state, user).await;
                    Ok(())
                }
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::LeaveRoom(result));
        }
        ClientCommand::LockRoom { lock } => {
            let result = match user.current_room() {
                Some(room) => room_result(room.set_lock(state, user, lock).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::LockRoom(result));
        }
        ClientCommand::CycleRoom { cycle } => {
            let result = match user.current_room() {
                Some(room) => room_result(room.set_cycle(state, user, cycle).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::CycleRoom(result));
        }
        ClientCommand::SelectChart { id } => select_chart(state, session, user, id).await,
        ClientCommand::RequestStart => {
            let result = match user.current_room() {
                Some(room) => room_result(room.request_start(state, user).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::RequestStart(result));
        }
        ClientCommand::Ready => {
            let result = match user.current_room() {
                Some(room) => room_result(room.ready(state, user).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::Ready(result));
        }
        ClientCommand::CancelReady => {
            let result = match user.current_room() {
                Some(room) => room_result(room.cancel_ready(state, user).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::CancelReady(result));
        }
        ClientCommand::Played { id } => played(state, session, user, id).await,
        ClientCommand::Abort => {
            let result = match user.current_room() {
                Some(room) => room_result(room.abort(state, user).await),
                None => Err("not in a room".to_owned()),
            };
            session.send(ServerCommand::Abort(result));
        }
    }
}

/// Touch streams update the reported game time, feed the replay recorder
/// and are relayed to the room's monitors. No response is sent.
async fn handle_touches(user: &Arc<User>, frames: Vec<TouchFrame>) {
    if let Some(frame) = frames.last() {
        *user.game_time.lock().unwrap() = frame.time;
    }
    let Some(room) = user.current_room() else {
        return;
    };
    {
        let mut replay = user.replay.lock().await;
        if let Some(writer) = replay.as_mut() {
            writer
                .append(&ClientCommand::Touches {
                    frames: frames.clone(),
                })
                .await;
        }
    }
    room.relay_to_monitors(ServerCommand::Touches {
        player: user.id,
        frames,
    })
    .await;
}

async fn handle_judges(user: &Arc<User>, judges: Vec<JudgeEvent>) {
    let Some(room) = user.current_room() else {
        return;
    };
    {
        let mut replay = user.replay.lock().await;
        if let Some(writer) = replay.as_mut() {
            writer
                .append(&ClientCommand::Judges {
                    judges: judges.clone(),
                })
                .await;
        }
    }
    room.relay_to_monitors(ServerCommand::Judges {
        player: user.id,
        judges,
    })
    .await;
}

fn valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn create_room(state: &Arc<AppState>, session: &Arc<Session>, user: &Arc<User>, id: String) {
    if !state.room_creation_enabled.load(Ordering::Relaxed) {
        session.send(ServerCommand::CreateRoom(Err(
            "room creation is disabled".to_owned()
        )));
        return;
    }
    if user.current_room().is_some() {
        session.send(ServerCommand::CreateRoom(Err(
            "already in a room".to_owned()
        )));
        return;
    }
    let id = if id == "0" {
        state.random_room_id()
    } else if valid_room_id(&id) {
        id
    } else {
        session.send(ServerCommand::CreateRoom(Err("invalid room id".to_owned())));
        return;
    };

    let room = Room::create(id.clone(), user);
    use dashmap::mapref::entry::Entry;
    match state.rooms.entry(id.clone()) {
        Entry::Occupied(_) => {
            *user.room.write().unwrap() = None;
            session.send(ServerCommand::CreateRoom(Err(
                "room already exists".to_owned()
            )));
            return;
        }
        Entry::Vacant(entry) => {
            entry.insert(Arc::clone(&room));
        }
    }
    tracing::info!(room = %id, user = user.id, "room created");
    session.send(ServerCommand::CreateRoom(Ok(())));
    room.system_chat(state, &format!("{} created the room", user.name()))
        .await;
    let view = room.view().await;
    state.push.room_update(&room.id, &view);
    state.push.admin_update(state).await;
}

async fn join_room(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    user: &Arc<User>,
    id: String,
    monitor: bool,
) {
    if user.current_room().is_some() {
        session.send(ServerCommand::JoinRoom(Err("already in a room".to_owned())));
        return;
    }
    let room = if id == "0" {
        match state.pick_recruiting_room().await {
            Some(room) => room,
            None => {
                session.send(ServerCommand::JoinRoom(Err(
                    "no recruiting room available".to_owned()
                )));
                return;
            }
        }
    } else {
        match state.rooms.get(&id) {
            Some(room) => Arc::clone(room.value()),
            None => {
                session.send(ServerCommand::JoinRoom(Err("room not found".to_owned())));
                return;
            }
        }
    };
    if state.admin_data.is_room_banned(&room.id, i64::from(user.id)) {
        session.send(ServerCommand::JoinRoom(Err(
            "you are banned from this room".to_owned()
        )));
        return;
    }
    let result = room
        .add_user(state, user, monitor)
        .await
        .map_err(|err| err.to_string());
    if result.is_ok() {
        tracing::info!(room = %room.id, user = user.id, monitor, "user joined room");
    }
    session.send(ServerCommand::JoinRoom(result));
}

async fn select_chart(state: &Arc<AppState>, session: &Arc<Session>, user: &Arc<User>, id: i32) {
    let Some(room) = user.current_room() else {
        session.send(ServerCommand::SelectChart(Err("not in a room".to_owned())));
        return;
    };
    if let Err(err) = room.can_select_chart(user).await {
        session.send(ServerCommand::SelectChart(Err(err.to_string())));
        return;
    }
    // The name lookup talks to the chart service; it must not happen
    // under the room lock and must never block the operation.
    let name = state.remote.chart_name(id).await;
    let result = room_result(room.select_chart(state, user, id, name).await);
    session.send(ServerCommand::SelectChart(result));
}

async fn played(state: &Arc<AppState>, session: &Arc<Session>, user: &Arc<User>, record_id: i32) {
    let Some(room) = user.current_room() else {
        session.send(ServerCommand::Played(Err("not in a room".to_owned())));
        return;
    };
    // Fetch and validate the record before touching the room lock.
    let record = match state.remote.record(record_id).await {
        Ok(record) => record,
        Err(err) => {
            session.send(ServerCommand::Played(Err(err.to_string())));
            return;
        }
    };
    if record.player != user.id {
        tracing::warn!(
            user = user.id,
            record = record_id,
            owner = record.player,
            "play record belongs to someone else"
        );
        session.send(ServerCommand::Played(Err(
            "record does not belong to you".to_owned()
        )));
        return;
    }
    {
        let mut replay = user.replay.lock().await;
        if let Some(writer) = replay.as_mut() {
            writer.update_record_id(record.id).await;
        }
    }
    let result = room_result(room.played(state, user, &record).await);
    session.send(ServerCommand::Played(result));
}
