//! Global in-memory state: the session, user and room registries, feature
//! flags, and the hooks that tie connection loss back into room cleanup.
//! Rooms and users are kept alive by `Arc`s from here; nothing survives a
//! process restart.

use crate::admin_data::AdminData;
use crate::config::Config;
use crate::remote::RemoteClient;
use crate::replay::ReplayWriter;
use crate::room::Room;
use crate::session::Session;
use crate::trust::TrustStore;
use crate::ws_push::PushHub;
use dashmap::DashMap;
use protocol::{ServerCommand, UserInfo};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Authors server-originated chat (welcome lines, admin broadcasts).
pub const SYSTEM_USER_ID: i32 = 0;

/// A game account, interned process-wide by id. Re-authentication of the
/// same id reuses the entry and rebinds its session.
pub struct User {
    pub id: i32,
    name: RwLock<String>,
    /// The owning session, tagged with its id so a stale disconnect can
    /// tell whether the user has already been rebound elsewhere.
    session: RwLock<Option<(Uuid, Weak<Session>)>>,
    sender: Mutex<Option<UnboundedSender<ServerCommand>>>,
    pub room: RwLock<Option<Arc<Room>>>,
    pub monitor: AtomicBool,
    /// Last play time reported through touch frames.
    pub game_time: Mutex<f32>,
    /// Active recorder while this user is playing.
    pub replay: tokio::sync::Mutex<Option<ReplayWriter>>,
}

impl User {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: RwLock::new(name.into()),
            session: RwLock::new(None),
            sender: Mutex::new(None),
            room: RwLock::new(None),
            monitor: AtomicBool::new(false),
            game_time: Mutex::new(0.0),
            replay: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write().unwrap() = name;
    }

    pub fn bind_session(&self, session: &Arc<Session>) {
        *self.session.write().unwrap() = Some((session.id, Arc::downgrade(session)));
        *self.sender.lock().unwrap() = Some(session.conn.sender());
    }

    /// Detaches the session binding without touching room membership.
    pub fn clear_binding(&self) {
        *self.session.write().unwrap() = None;
        *self.sender.lock().unwrap() = None;
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.read().unwrap().as_ref().map(|(id, _)| *id)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap()
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| !s.conn.is_closed())
    }

    /// Enqueues a command on whatever connection the user currently has.
    /// Disconnected users drop the command on the floor.
    pub fn try_send(&self, cmd: ServerCommand) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(cmd);
        }
    }

    /// Binds a bare channel in place of a session; room tests drive users
    /// through this.
    #[cfg(test)]
    pub fn attach_sender(&self, tx: UnboundedSender<ServerCommand>) {
        *self.sender.lock().unwrap() = Some(tx);
    }

    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room.read().unwrap().clone()
    }

    pub fn to_info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            name: self.name(),
            monitor: self.monitor.load(Ordering::Relaxed),
        }
    }
}

pub struct AppState {
    pub config: Config,
    pub started: Instant,
    pub sessions: DashMap<Uuid, Arc<Session>>,
    pub users: DashMap<i32, Arc<User>>,
    pub rooms: DashMap<String, Arc<Room>>,
    /// Feature flags, togglable through the admin surface.
    pub replay_enabled: AtomicBool,
    pub room_creation_enabled: AtomicBool,
    pub admin_data: AdminData,
    pub trust: TrustStore,
    pub push: PushHub,
    pub remote: RemoteClient,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let admin_data = AdminData::load(config.admin_data_path())?;
        let remote = RemoteClient::new(&config.api_base)?;
        let state = Arc::new(Self {
            started: Instant::now(),
            sessions: DashMap::new(),
            users: DashMap::new(),
            rooms: DashMap::new(),
            replay_enabled: AtomicBool::new(false),
            room_creation_enabled: AtomicBool::new(true),
            admin_data,
            trust: TrustStore::default(),
            push: PushHub::default(),
            remote,
            config,
        });
        state
            .users
            .insert(SYSTEM_USER_ID, Arc::new(User::new(SYSTEM_USER_ID, "server")));
        Ok(state)
    }

    /// Fetches or creates the user entry for an authenticated id, keeping
    /// the display name current.
    pub fn intern_user(&self, id: i32, name: &str) -> Arc<User> {
        use dashmap::mapref::entry::Entry;
        match self.users.entry(id) {
            Entry::Occupied(entry) => {
                let user = Arc::clone(entry.get());
                user.set_name(name.to_owned());
                user
            }
            Entry::Vacant(entry) => {
                let user = Arc::new(User::new(id, name));
                entry.insert(Arc::clone(&user));
                user
            }
        }
    }

    /// A random 6-digit decimal id not currently in use.
    pub fn random_room_id(&self) -> String {
        loop {
            let id = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }

    /// Picks uniformly among rooms open to random matchmaking.
    pub async fn pick_recruiting_room(&self) -> Option<Arc<Room>> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        let mut open = Vec::new();
        for room in rooms {
            if room.accepts_recruits().await {
                open.push(room);
            }
        }
        if open.is_empty() {
            return None;
        }
        let pick = rand::rng().random_range(0..open.len());
        Some(open.swap_remove(pick))
    }

    /// System chat to every connected session.
    pub fn broadcast_chat(&self, content: &str) {
        let cmd = ServerCommand::Message(protocol::Message::Chat {
            user: SYSTEM_USER_ID,
            content: content.to_owned(),
        });
        for session in self.sessions.iter() {
            session.conn.send(cmd.clone());
        }
    }
}
