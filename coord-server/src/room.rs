//! The room state machine. Every mutating operation takes the room's
//! mutex for the whole transition and performs its broadcasts while the
//! lock is held, so all members observe state changes in the same order.
//! Cross-room operations never hold two room locks at once.

use crate::remote::RemoteRecord;
use crate::replay::ReplayWriter;
use crate::server_state::{AppState, SYSTEM_USER_ID, User};
use protocol::{ClientRoomState, JoinRoomResponse, Message, RoomState, ServerCommand};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;

pub const DEFAULT_MAX_PLAYERS: usize = 32678;
/// Chat line delivered before a contest room's sessions are dropped.
pub const CONTEST_DISBAND_MESSAGE: &str = "房间已被管理员解散:比赛已结束";
/// Chat line for an explicit admin disband.
pub const ADMIN_DISBAND_MESSAGE: &str = "房间已被管理员解散";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("only the host can do that")]
    NotHost,
    #[error("the room is not in the right state for that")]
    WrongState,
    #[error("the room is full")]
    RoomFull,
    #[error("the room is locked")]
    RoomLocked,
    #[error("you are not on the contest whitelist")]
    NotWhitelisted,
    #[error("no chart has been selected")]
    NoChartSelected,
    #[error("you are not playing in this room")]
    NotPlayer,
    #[error("not all players are ready")]
    NotAllReady,
}

/// One finished play as admitted into the room's result table.
#[derive(Debug, Clone, Copy)]
pub struct PlayResult {
    pub score: i32,
    pub accuracy: f32,
    pub full_combo: bool,
}

struct RoomInner {
    state: RoomState,
    players: Vec<Arc<User>>,
    monitors: Vec<Arc<User>>,
    host: i32,
    selected_chart: Option<i32>,
    chart_name: Option<String>,
    locked: bool,
    cycle: bool,
    recruiting: bool,
    live: bool,
    contest_mode: bool,
    max_players: usize,
    whitelist: HashSet<i64>,
    ready: HashSet<i32>,
    play_results: HashMap<i32, PlayResult>,
    play_record_ids: HashMap<i32, i32>,
    aborted: HashSet<i32>,
}

pub struct Room {
    pub id: String,
    inner: Mutex<RoomInner>,
}

fn members(inner: &RoomInner) -> impl Iterator<Item = &Arc<User>> {
    inner.players.iter().chain(inner.monitors.iter())
}

fn broadcast(inner: &RoomInner, cmd: ServerCommand) {
    for user in members(inner) {
        user.try_send(cmd.clone());
    }
}

fn broadcast_message(inner: &RoomInner, message: Message) {
    broadcast(inner, ServerCommand::Message(message));
}

fn all_ready(inner: &RoomInner) -> bool {
    members(inner).all(|user| inner.ready.contains(&user.id))
}

impl Room {
    /// Creates a room with `host` as its sole player and binds the host's
    /// room reference. Registration in the global registry is the caller's
    /// job so id collisions can be rejected first.
    pub fn create(id: String, host: &Arc<User>) -> Arc<Self> {
        let room = Arc::new(Self {
            id,
            inner: Mutex::new(RoomInner {
                state: RoomState::SelectChart,
                players: vec![Arc::clone(host)],
                monitors: Vec::new(),
                host: host.id,
                selected_chart: None,
                chart_name: None,
                locked: false,
                cycle: false,
                recruiting: true,
                live: false,
                contest_mode: false,
                max_players: DEFAULT_MAX_PLAYERS,
                whitelist: HashSet::new(),
                ready: HashSet::new(),
                play_results: HashMap::new(),
                play_record_ids: HashMap::new(),
                aborted: HashSet::new(),
            }),
        });
        *host.room.write().unwrap() = Some(Arc::clone(&room));
        host.monitor.store(false, Ordering::Relaxed);
        room
    }

    /// Whether random matchmaking may land here.
    pub async fn accepts_recruits(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.recruiting && !inner.locked && inner.players.len() < inner.max_players
    }

    pub async fn host_id(&self) -> i32 {
        self.inner.lock().await.host
    }

    /// The selected chart with its cached display name.
    pub async fn chart(&self) -> Option<(i32, Option<String>)> {
        let inner = self.inner.lock().await;
        inner
            .selected_chart
            .map(|id| (id, inner.chart_name.clone()))
    }

    pub async fn client_room_state(&self, user: &Arc<User>) -> ClientRoomState {
        let inner = self.inner.lock().await;
        ClientRoomState {
            id: self.id.clone(),
            state: inner.state,
            live: inner.live,
            locked: inner.locked,
            cycle: inner.cycle,
            is_host: inner.host == user.id,
            is_ready: inner.ready.contains(&user.id),
            users: members(&inner).map(|u| (u.id, u.to_info())).collect(),
            selected_chart: inner.selected_chart,
        }
    }

    /// Adds a member. Monitors are always accepted and mark the room live;
    /// players face the lock, the contest whitelist, the capacity limit
    /// and the chart-selection gate.
    pub async fn add_user(
        self: &Arc<Self>,
        state: &Arc<AppState>,
        user: &Arc<User>,
        monitor: bool,
    ) -> Result<JoinRoomResponse, RoomError> {
        let mut inner = self.inner.lock().await;
        if monitor {
            inner.monitors.push(Arc::clone(user));
            inner.live = true;
            user.monitor.store(true, Ordering::Relaxed);
        } else {
            if inner.locked {
                return Err(RoomError::RoomLocked);
            }
            if inner.contest_mode && !inner.whitelist.contains(&i64::from(user.id)) {
                return Err(RoomError::NotWhitelisted);
            }
            if inner.players.len() >= inner.max_players {
                return Err(RoomError::RoomFull);
            }
            // Players joining mid-game would never show up in the result
            // table and stall the completion check.
            if inner.state != RoomState::SelectChart {
                return Err(RoomError::WrongState);
            }
            inner.players.push(Arc::clone(user));
            user.monitor.store(false, Ordering::Relaxed);
        }
        *user.room.write().unwrap() = Some(Arc::clone(self));

        let info = user.to_info();
        for member in members(&inner).filter(|member| member.id != user.id) {
            member.try_send(ServerCommand::OnJoinRoom(info.clone()));
        }
        broadcast_message(
            &inner,
            Message::JoinRoom {
                user: user.id,
                name: user.name(),
            },
        );
        let response = JoinRoomResponse {
            state: inner.state,
            users: members(&inner).map(|u| u.to_info()).collect(),
            live: inner.live,
        };
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(response)
    }

    /// Removes a member, handling host succession, room destruction and
    /// progress re-evaluation.
    pub async fn on_user_leave(self: &Arc<Self>, state: &Arc<AppState>, user: &Arc<User>) {
        let mut inner = self.inner.lock().await;
        broadcast_message(
            &inner,
            Message::LeaveRoom {
                user: user.id,
                name: user.name(),
            },
        );
        inner.players.retain(|member| member.id != user.id);
        inner.monitors.retain(|member| member.id != user.id);
        inner.ready.remove(&user.id);
        *user.room.write().unwrap() = None;
        user.monitor.store(false, Ordering::Relaxed);
        if let Some(mut writer) = user.replay.lock().await.take() {
            writer.dispose().await;
        }

        if inner.players.is_empty() {
            for monitor in inner.monitors.drain(..) {
                *monitor.room.write().unwrap() = None;
                monitor.monitor.store(false, Ordering::Relaxed);
            }
            drop(inner);
            state.rooms.remove(&self.id);
            tracing::info!(room = %self.id, "last player left, room destroyed");
            state.push.admin_update(state).await;
            return;
        }

        if inner.host == user.id {
            let new_host = Arc::clone(&inner.players[0]);
            inner.host = new_host.id;
            new_host.try_send(ServerCommand::ChangeHost(true));
            broadcast_message(&inner, Message::NewHost { user: new_host.id });
        }

        // The departure may have completed a readiness or result set.
        let contest_end = match inner.state {
            RoomState::WaitingForReady => {
                if !inner.contest_mode && all_ready(&inner) {
                    self.start_playing(state, &mut inner).await;
                }
                false
            }
            RoomState::Playing => self.check_game_end(state, &mut inner).await,
            RoomState::SelectChart => false,
        };
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        if contest_end {
            self.disband(state, CONTEST_DISBAND_MESSAGE).await;
        }
    }

    pub async fn chat(&self, state: &Arc<AppState>, user: &Arc<User>, content: String) {
        let inner = self.inner.lock().await;
        broadcast_message(
            &inner,
            Message::Chat {
                user: user.id,
                content: content.clone(),
            },
        );
        drop(inner);
        state
            .push
            .room_log(&self.id, &format!("{}: {content}", user.name()));
    }

    /// System-authored chat into this room (admin surface).
    pub async fn system_chat(&self, state: &Arc<AppState>, content: &str) {
        let inner = self.inner.lock().await;
        broadcast_message(
            &inner,
            Message::Chat {
                user: SYSTEM_USER_ID,
                content: content.to_owned(),
            },
        );
        drop(inner);
        state.push.room_log(&self.id, content);
    }

    pub async fn set_lock(
        &self,
        state: &Arc<AppState>,
        user: &Arc<User>,
        lock: bool,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.host != user.id {
            return Err(RoomError::NotHost);
        }
        inner.locked = lock;
        // A locked room is closed to matchmaking by definition.
        inner.recruiting = !lock;
        broadcast_message(&inner, Message::LockRoom { lock });
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    pub async fn set_cycle(
        &self,
        state: &Arc<AppState>,
        user: &Arc<User>,
        cycle: bool,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.host != user.id {
            return Err(RoomError::NotHost);
        }
        inner.cycle = cycle;
        broadcast_message(&inner, Message::CycleRoom { cycle });
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    /// Cheap pre-check so the chart name lookup is only paid for requests
    /// that could succeed.
    pub async fn can_select_chart(&self, user: &Arc<User>) -> Result<(), RoomError> {
        let inner = self.inner.lock().await;
        if inner.host != user.id {
            return Err(RoomError::NotHost);
        }
        if inner.state != RoomState::SelectChart {
            return Err(RoomError::WrongState);
        }
        Ok(())
    }

    /// Applies a chart selection. Conditions are re-validated because the
    /// name lookup happened outside the lock.
    pub async fn select_chart(
        &self,
        state: &Arc<AppState>,
        user: &Arc<User>,
        id: i32,
        name: String,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.host != user.id {
            return Err(RoomError::NotHost);
        }
        if inner.state != RoomState::SelectChart {
            return Err(RoomError::WrongState);
        }
        inner.selected_chart = Some(id);
        inner.chart_name = Some(name.clone());
        broadcast_message(
            &inner,
            Message::SelectChart {
                user: user.id,
                name,
                id,
            },
        );
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    /// Host-initiated transition into the ready-up phase. The host is
    /// marked ready pre-emptively and readiness is evaluated right away,
    /// so a solo room starts immediately.
    pub async fn request_start(
        &self,
        state: &Arc<AppState>,
        user: &Arc<User>,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.host != user.id {
            return Err(RoomError::NotHost);
        }
        if inner.state != RoomState::SelectChart {
            return Err(RoomError::WrongState);
        }
        if inner.selected_chart.is_none() {
            return Err(RoomError::NoChartSelected);
        }
        inner.state = RoomState::WaitingForReady;
        inner.ready.clear();
        inner.ready.insert(user.id);
        broadcast_message(&inner, Message::GameStart { user: user.id });
        broadcast(
            &inner,
            ServerCommand::ChangeState {
                state: RoomState::WaitingForReady,
                chart: None,
            },
        );
        if !inner.contest_mode && all_ready(&inner) {
            self.start_playing(state, &mut inner).await;
        }
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    pub async fn ready(&self, state: &Arc<AppState>, user: &Arc<User>) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::WaitingForReady {
            return Err(RoomError::WrongState);
        }
        inner.ready.insert(user.id);
        broadcast_message(&inner, Message::Ready { user: user.id });
        if !inner.contest_mode && all_ready(&inner) {
            self.start_playing(state, &mut inner).await;
        }
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    /// From the host this cancels the whole ready-up phase; from anyone
    /// else it only withdraws their own readiness.
    pub async fn cancel_ready(
        &self,
        state: &Arc<AppState>,
        user: &Arc<User>,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::WaitingForReady {
            return Err(RoomError::WrongState);
        }
        if inner.host == user.id {
            inner.ready.clear();
            broadcast_message(&inner, Message::CancelGame { user: user.id });
            inner.state = RoomState::SelectChart;
            let chart = inner.selected_chart;
            broadcast(
                &inner,
                ServerCommand::ChangeState {
                    state: RoomState::SelectChart,
                    chart,
                },
            );
        } else {
            inner.ready.remove(&user.id);
            broadcast_message(&inner, Message::CancelReady { user: user.id });
        }
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    /// Admin override: start a waiting room, optionally without requiring
    /// everyone to be ready. Contest rooms only ever start through this.
    pub async fn start_manually(
        &self,
        state: &Arc<AppState>,
        force: bool,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::WaitingForReady {
            return Err(RoomError::WrongState);
        }
        if !force && !all_ready(&inner) {
            return Err(RoomError::NotAllReady);
        }
        self.start_playing(state, &mut inner).await;
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        Ok(())
    }

    /// Records a validated play result. The caller has already checked the
    /// record's authenticity and patched the replay header.
    pub async fn played(
        self: &Arc<Self>,
        state: &Arc<AppState>,
        user: &Arc<User>,
        record: &RemoteRecord,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::Playing {
            return Err(RoomError::WrongState);
        }
        if !inner.players.iter().any(|player| player.id == user.id) {
            return Err(RoomError::NotPlayer);
        }
        inner.play_results.insert(
            user.id,
            PlayResult {
                score: record.score,
                accuracy: record.accuracy,
                full_combo: record.full_combo,
            },
        );
        inner.play_record_ids.insert(user.id, record.id);
        broadcast_message(
            &inner,
            Message::Played {
                user: user.id,
                score: record.score,
                accuracy: record.accuracy,
                full_combo: record.full_combo,
            },
        );
        let contest_end = self.check_game_end(state, &mut inner).await;
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        if contest_end {
            self.disband(state, CONTEST_DISBAND_MESSAGE).await;
        }
        Ok(())
    }

    pub async fn abort(self: &Arc<Self>, state: &Arc<AppState>, user: &Arc<User>) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::Playing {
            return Err(RoomError::WrongState);
        }
        if !inner.players.iter().any(|player| player.id == user.id) {
            return Err(RoomError::NotPlayer);
        }
        inner.aborted.insert(user.id);
        broadcast_message(&inner, Message::Abort { user: user.id });
        let contest_end = self.check_game_end(state, &mut inner).await;
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
        if contest_end {
            self.disband(state, CONTEST_DISBAND_MESSAGE).await;
        }
        Ok(())
    }

    /// Entry into `Playing`: fresh result tables, replay writers when the
    /// feature is on, then the broadcasts.
    async fn start_playing(&self, state: &Arc<AppState>, inner: &mut RoomInner) {
        inner.play_results.clear();
        inner.play_record_ids.clear();
        inner.aborted.clear();
        if state.replay_enabled.load(Ordering::Relaxed)
            && let Some(chart) = inner.selected_chart
        {
            for player in &inner.players {
                match ReplayWriter::create(&state.config.record_dir(), player.id, chart).await {
                    Ok(writer) => *player.replay.lock().await = Some(writer),
                    Err(err) => {
                        tracing::error!(?err, user = player.id, "failed to start replay writer");
                    }
                }
            }
        }
        broadcast_message(inner, Message::StartPlaying);
        inner.state = RoomState::Playing;
        broadcast(
            inner,
            ServerCommand::ChangeState {
                state: RoomState::Playing,
                chart: None,
            },
        );
        state.push.room_log(&self.id, "game started");
    }

    /// Exit check for `Playing`: once every player has either a result or
    /// an abort, the game ends. Returns whether a contest finalization is
    /// pending; the caller performs the disband after releasing the lock.
    async fn check_game_end(&self, state: &Arc<AppState>, inner: &mut RoomInner) -> bool {
        if inner.state != RoomState::Playing {
            return false;
        }
        let finished = inner.players.iter().all(|player| {
            inner.play_results.contains_key(&player.id) || inner.aborted.contains(&player.id)
        });
        if !finished {
            return false;
        }
        for player in &inner.players {
            if let Some(mut writer) = player.replay.lock().await.take() {
                writer.dispose().await;
            }
        }
        broadcast_message(inner, Message::GameEnd);
        state.push.room_log(&self.id, "game finished");
        if inner.contest_mode {
            tracing::info!(room = %self.id, "contest play finished, room will be disbanded");
            return true;
        }
        inner.ready.clear();
        inner.play_results.clear();
        inner.play_record_ids.clear();
        inner.aborted.clear();
        if inner.cycle && inner.players.len() >= 2 {
            let index = inner
                .players
                .iter()
                .position(|player| player.id == inner.host)
                .unwrap_or(0);
            let next = (index + 1) % inner.players.len();
            let old_host = Arc::clone(&inner.players[index]);
            let new_host = Arc::clone(&inner.players[next]);
            inner.host = new_host.id;
            old_host.try_send(ServerCommand::ChangeHost(false));
            new_host.try_send(ServerCommand::ChangeHost(true));
            broadcast_message(inner, Message::NewHost { user: new_host.id });
        }
        inner.state = RoomState::SelectChart;
        let chart = inner.selected_chart;
        broadcast(
            inner,
            ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart,
            },
        );
        false
    }

    /// Delivers a final chat line, detaches every member and removes the
    /// room. Member sockets are closed shortly afterwards, leaving the
    /// sender task a moment to flush the farewell.
    pub async fn disband(self: &Arc<Self>, state: &Arc<AppState>, reason: &str) {
        let leavers: Vec<Arc<User>> = {
            let mut guard = self.inner.lock().await;
            broadcast_message(
                &guard,
                Message::Chat {
                    user: SYSTEM_USER_ID,
                    content: reason.to_owned(),
                },
            );
            let inner = &mut *guard;
            inner
                .players
                .drain(..)
                .chain(inner.monitors.drain(..))
                .collect()
        };
        for user in &leavers {
            *user.room.write().unwrap() = None;
            user.monitor.store(false, Ordering::Relaxed);
            if let Some(mut writer) = user.replay.lock().await.take() {
                writer.dispose().await;
            }
        }
        state.rooms.remove(&self.id);
        tracing::info!(room = %self.id, reason, "room disbanded");

        let sessions: Vec<_> = leavers.iter().filter_map(|user| user.session()).collect();
        if !sessions.is_empty() {
            tokio::spawn(async move {
                // Let the farewell chat drain through the send queues.
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                for session in sessions {
                    session.conn.close();
                }
            });
        }
        state.push.admin_update(state).await;
    }

    /// Admin cap on concurrent players.
    pub async fn set_max_players(&self, state: &Arc<AppState>, max: usize) {
        let mut inner = self.inner.lock().await;
        inner.max_players = max;
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
    }

    /// Admin contest toggle, optionally replacing the whitelist.
    pub async fn set_contest(
        &self,
        state: &Arc<AppState>,
        enabled: bool,
        whitelist: Option<Vec<i64>>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.contest_mode = enabled;
        if let Some(ids) = whitelist {
            inner.whitelist = ids.into_iter().collect();
        }
        let view = view_locked(&self.id, &inner);
        drop(inner);
        state.push.room_update(&self.id, &view);
    }

    pub async fn set_whitelist(&self, ids: Vec<i64>) {
        self.inner.lock().await.whitelist = ids.into_iter().collect();
    }

    /// Relays live input streams (touches, judgements) to the room's
    /// monitors only.
    pub async fn relay_to_monitors(&self, cmd: ServerCommand) {
        let inner = self.inner.lock().await;
        for monitor in &inner.monitors {
            monitor.try_send(cmd.clone());
        }
    }

    pub async fn view(&self) -> RoomView {
        let inner = self.inner.lock().await;
        view_locked(&self.id, &inner)
    }
}

/// JSON projection served over HTTP and pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub id: String,
    pub state: &'static str,
    pub host_id: i32,
    pub host_name: String,
    pub player_count: usize,
    pub monitor_count: usize,
    pub is_locked: bool,
    pub is_cycle: bool,
    pub is_live: bool,
    pub is_recruiting: bool,
    pub selected_chart_id: Option<i32>,
    pub players: Vec<RoomViewPlayer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomViewPlayer {
    pub id: i32,
    pub name: String,
    pub is_monitor: bool,
}

fn state_name(state: RoomState) -> &'static str {
    match state {
        RoomState::SelectChart => "SelectChart",
        RoomState::WaitingForReady => "WaitingForReady",
        RoomState::Playing => "Playing",
    }
}

fn view_locked(id: &str, inner: &RoomInner) -> RoomView {
    let host_name = inner
        .players
        .iter()
        .find(|player| player.id == inner.host)
        .map(|player| player.name())
        .unwrap_or_default();
    RoomView {
        id: id.to_owned(),
        state: state_name(inner.state),
        host_id: inner.host,
        host_name,
        player_count: inner.players.len(),
        monitor_count: inner.monitors.len(),
        is_locked: inner.locked,
        is_cycle: inner.cycle,
        is_live: inner.live,
        is_recruiting: inner.recruiting,
        selected_chart_id: inner.selected_chart,
        players: members(inner)
            .map(|user| RoomViewPlayer {
                id: user.id,
                name: user.name(),
                is_monitor: user.monitor.load(Ordering::Relaxed),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn app_state() -> Arc<AppState> {
        AppState::new(Config::default()).unwrap()
    }

    fn make_user(id: i32, name: &str) -> (Arc<User>, UnboundedReceiver<ServerCommand>) {
        let user = Arc::new(User::new(id, name));
        let (tx, rx) = unbounded_channel();
        user.attach_sender(tx);
        (user, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerCommand>) -> Vec<ServerCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn record(id: i32, player: i32, score: i32) -> RemoteRecord {
        RemoteRecord {
            id,
            player,
            score,
            accuracy: 0.98,
            full_combo: true,
        }
    }

    fn state_changes(cmds: &[ServerCommand]) -> Vec<(RoomState, Option<i32>)> {
        cmds.iter()
            .filter_map(|cmd| match cmd {
                ServerCommand::ChangeState { state, chart } => Some((*state, *chart)),
                _ => None,
            })
            .collect()
    }

    fn messages(cmds: &[ServerCommand]) -> Vec<&Message> {
        cmds.iter()
            .filter_map(|cmd| match cmd {
                ServerCommand::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn solo_play_cycle_returns_to_chart_selection() {
        let state = app_state();
        let (host, mut rx) = make_user(42, "A");
        let room = Room::create("52A7F1".to_owned(), &host);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));

        room.select_chart(&state, &host, 100, "Chart100".to_owned())
            .await
            .unwrap();
        // The sole member is ready the moment the host requests the start.
        room.request_start(&state, &host).await.unwrap();
        room.played(&state, &host, &record(7, 42, 900_000))
            .await
            .unwrap();

        let cmds = drain(&mut rx);
        assert_eq!(
            state_changes(&cmds),
            vec![
                (RoomState::WaitingForReady, None),
                (RoomState::Playing, None),
                (RoomState::SelectChart, Some(100)),
            ]
        );
        let msgs = messages(&cmds);
        assert!(msgs.iter().any(|m| matches!(m, Message::GameStart { user: 42 })));
        assert!(msgs.iter().any(|m| matches!(m, Message::StartPlaying)));
        assert!(msgs.iter().any(|m| matches!(
            m,
            Message::Played { user: 42, score: 900_000, full_combo: true, .. }
        )));
        assert!(msgs.iter().any(|m| matches!(m, Message::GameEnd)));

        let snapshot = room.client_room_state(&host).await;
        assert_eq!(snapshot.state, RoomState::SelectChart);
        assert!(!snapshot.is_ready);
        assert_eq!(snapshot.selected_chart, Some(100));
    }

    #[tokio::test]
    async fn cycle_mode_rotates_host_after_game() {
        let state = app_state();
        let (p1, mut rx1) = make_user(1, "P1");
        let (p2, mut rx2) = make_user(2, "P2");
        let room = Room::create("000001".to_owned(), &p1);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));
        room.add_user(&state, &p2, false).await.unwrap();
        room.set_cycle(&state, &p1, true).await.unwrap();
        room.select_chart(&state, &p1, 5, "Chart5".to_owned())
            .await
            .unwrap();

        room.request_start(&state, &p1).await.unwrap();
        room.ready(&state, &p2).await.unwrap();
        room.played(&state, &p1, &record(11, 1, 500_000))
            .await
            .unwrap();
        room.played(&state, &p2, &record(12, 2, 600_000))
            .await
            .unwrap();

        let cmds1 = drain(&mut rx1);
        let cmds2 = drain(&mut rx2);
        assert!(cmds1
            .iter()
            .any(|cmd| matches!(cmd, ServerCommand::ChangeHost(false))));
        assert!(cmds2
            .iter()
            .any(|cmd| matches!(cmd, ServerCommand::ChangeHost(true))));
        assert!(messages(&cmds1)
            .iter()
            .any(|m| matches!(m, Message::NewHost { user: 2 })));
        assert_eq!(room.host_id().await, 2);
    }

    #[tokio::test]
    async fn contest_room_gates_players_and_disbands_after_play() {
        let state = app_state();
        let (host, mut host_rx) = make_user(10, "Host");
        let room = Room::create("777777".to_owned(), &host);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));
        room.set_contest(&state, true, Some(vec![10, 20])).await;

        let (outsider, _outsider_rx) = make_user(30, "Out");
        assert_eq!(
            room.add_user(&state, &outsider, false).await.unwrap_err(),
            RoomError::NotWhitelisted
        );
        assert!(outsider.current_room().is_none());

        // Monitors bypass the whitelist and mark the room live.
        let (watcher, _watcher_rx) = make_user(30, "Out");
        room.add_user(&state, &watcher, true).await.unwrap();
        let (p2, mut p2_rx) = make_user(20, "P2");
        let response = room.add_user(&state, &p2, false).await.unwrap();
        assert!(response.live);

        room.select_chart(&state, &host, 5, "Chart5".to_owned())
            .await
            .unwrap();
        room.request_start(&state, &host).await.unwrap();
        room.ready(&state, &p2).await.unwrap();
        // Contest rooms never start on their own.
        assert_eq!(
            room.client_room_state(&host).await.state,
            RoomState::WaitingForReady
        );
        assert_eq!(
            room.start_manually(&state, false).await.unwrap_err(),
            RoomError::NotAllReady
        );
        room.start_manually(&state, true).await.unwrap();

        room.played(&state, &host, &record(21, 10, 700_000))
            .await
            .unwrap();
        room.played(&state, &p2, &record(22, 20, 800_000))
            .await
            .unwrap();

        // One play, then the room is gone and everyone was told why.
        assert!(state.rooms.get("777777").is_none());
        assert!(host.current_room().is_none());
        assert!(p2.current_room().is_none());
        assert!(watcher.current_room().is_none());
        for rx in [&mut host_rx, &mut p2_rx] {
            let cmds = drain(rx);
            assert!(messages(&cmds).iter().any(|m| matches!(
                m,
                Message::Chat { user: SYSTEM_USER_ID, content } if content == CONTEST_DISBAND_MESSAGE
            )));
        }
    }

    #[tokio::test]
    async fn host_departure_promotes_next_player() {
        let state = app_state();
        let (p1, _rx1) = make_user(1, "P1");
        let (p2, mut rx2) = make_user(2, "P2");
        let room = Room::create("123456".to_owned(), &p1);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));
        room.add_user(&state, &p2, false).await.unwrap();

        room.on_user_leave(&state, &p1).await;

        let cmds = drain(&mut rx2);
        let msgs = messages(&cmds);
        assert!(msgs.iter().any(|m| matches!(
            m,
            Message::LeaveRoom { user: 1, name } if name == "P1"
        )));
        assert!(msgs.iter().any(|m| matches!(m, Message::NewHost { user: 2 })));
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, ServerCommand::ChangeHost(true))));
        assert!(state.rooms.get("123456").is_some());
        assert_eq!(room.host_id().await, 2);
        assert!(p1.current_room().is_none());
    }

    #[tokio::test]
    async fn last_player_leaving_destroys_the_room() {
        let state = app_state();
        let (p1, _rx1) = make_user(1, "P1");
        let (watcher, _wrx) = make_user(5, "W");
        let room = Room::create("654321".to_owned(), &p1);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));
        room.add_user(&state, &watcher, true).await.unwrap();

        room.on_user_leave(&state, &p1).await;
        assert!(state.rooms.get("654321").is_none());
        assert!(watcher.current_room().is_none());
    }

    #[tokio::test]
    async fn locked_and_full_rooms_reject_players() {
        let state = app_state();
        let (host, _rx) = make_user(1, "Host");
        let room = Room::create("222222".to_owned(), &host);

        room.set_lock(&state, &host, true).await.unwrap();
        assert!(!room.accepts_recruits().await);
        let (joiner, _jrx) = make_user(2, "J");
        assert_eq!(
            room.add_user(&state, &joiner, false).await.unwrap_err(),
            RoomError::RoomLocked
        );

        room.set_lock(&state, &host, false).await.unwrap();
        assert!(room.accepts_recruits().await);
        room.set_max_players(&state, 1).await;
        assert_eq!(
            room.add_user(&state, &joiner, false).await.unwrap_err(),
            RoomError::RoomFull
        );
        // Monitors are exempt from the capacity limit.
        let (watcher, _wrx) = make_user(3, "W");
        room.add_user(&state, &watcher, true).await.unwrap();
    }

    #[tokio::test]
    async fn only_the_host_controls_the_room() {
        let state = app_state();
        let (host, _rx1) = make_user(1, "Host");
        let (p2, _rx2) = make_user(2, "P2");
        let room = Room::create("333333".to_owned(), &host);
        room.add_user(&state, &p2, false).await.unwrap();

        assert_eq!(
            room.set_lock(&state, &p2, true).await.unwrap_err(),
            RoomError::NotHost
        );
        assert_eq!(
            room.set_cycle(&state, &p2, true).await.unwrap_err(),
            RoomError::NotHost
        );
        assert_eq!(
            room.select_chart(&state, &p2, 1, "X".to_owned())
                .await
                .unwrap_err(),
            RoomError::NotHost
        );
        assert_eq!(
            room.request_start(&state, &p2).await.unwrap_err(),
            RoomError::NotHost
        );
        // And the host cannot start without a chart.
        assert_eq!(
            room.request_start(&state, &host).await.unwrap_err(),
            RoomError::NoChartSelected
        );
    }

    #[tokio::test]
    async fn host_cancel_ready_returns_to_chart_selection() {
        let state = app_state();
        let (host, mut rx1) = make_user(1, "Host");
        let (p2, _rx2) = make_user(2, "P2");
        let room = Room::create("444444".to_owned(), &host);
        room.add_user(&state, &p2, false).await.unwrap();
        room.select_chart(&state, &host, 9, "Chart9".to_owned())
            .await
            .unwrap();
        room.request_start(&state, &host).await.unwrap();

        // A non-host cancel only withdraws that player's readiness.
        room.cancel_ready(&state, &p2).await.unwrap();
        assert_eq!(
            room.client_room_state(&host).await.state,
            RoomState::WaitingForReady
        );

        room.cancel_ready(&state, &host).await.unwrap();
        let snapshot = room.client_room_state(&host).await;
        assert_eq!(snapshot.state, RoomState::SelectChart);
        assert!(!snapshot.is_ready);
        let cmds = drain(&mut rx1);
        assert!(messages(&cmds)
            .iter()
            .any(|m| matches!(m, Message::CancelGame { user: 1 })));
        assert_eq!(
            state_changes(&cmds).last(),
            Some(&(RoomState::SelectChart, Some(9)))
        );
    }

    #[tokio::test]
    async fn abort_counts_toward_completion() {
        let state = app_state();
        let (p1, mut rx1) = make_user(1, "P1");
        let (p2, _rx2) = make_user(2, "P2");
        let room = Room::create("555555".to_owned(), &p1);
        state.rooms.insert(room.id.clone(), Arc::clone(&room));
        room.add_user(&state, &p2, false).await.unwrap();
        room.select_chart(&state, &p1, 3, "Chart3".to_owned())
            .await
            .unwrap();
        room.request_start(&state, &p1).await.unwrap();
        room.ready(&state, &p2).await.unwrap();

        room.abort(&state, &p1).await.unwrap();
        assert_eq!(
            room.client_room_state(&p1).await.state,
            RoomState::Playing
        );
        room.played(&state, &p2, &record(31, 2, 650_000))
            .await
            .unwrap();

        let cmds = drain(&mut rx1);
        let msgs = messages(&cmds);
        assert!(msgs.iter().any(|m| matches!(m, Message::Abort { user: 1 })));
        assert!(msgs.iter().any(|m| matches!(m, Message::GameEnd)));
        assert_eq!(
            room.client_room_state(&p1).await.state,
            RoomState::SelectChart
        );
    }
}
