//! The two tagged command families exchanged over the game TCP stream, and
//! the broadcast [`Message`] family carried inside server commands. The
//! `match` arms in the encoders and decoders below are the single source of
//! truth for the wire format.
//!
//! Framing (the ULEB128 length prefix) happens one layer further out; a
//! payload handed to [`ClientCommand::decode`] or [`ServerCommand::decode`]
//! is exactly one command, starting with its tag byte.

use crate::codec::{ByteReader, WireError, write_bool, write_f16, write_string};
use crate::varint::write_uleb128;
use bytes::{BufMut, BytesMut};
use half::f16;
use std::collections::HashMap;

/// One sampled touch pointer inside a [`TouchFrame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub id: i8,
    pub x: f16,
    pub y: f16,
}

/// All touch pointers sampled at one game-time instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchFrame {
    pub time: f32,
    pub points: Vec<TouchPoint>,
}

/// A single judgement emitted by the client while playing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JudgeEvent {
    pub time: f32,
    pub line_id: u32,
    pub note_id: u32,
    pub judgement: u8,
}

/// The room lifecycle state as a single wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomState {
    #[default]
    SelectChart,
    WaitingForReady,
    Playing,
}

impl RoomState {
    fn encode(self, buf: &mut BytesMut) {
        buf.put_u8(match self {
            RoomState::SelectChart => 0,
            RoomState::WaitingForReady => 1,
            RoomState::Playing => 2,
        });
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        match reader.u8()? {
            0 => Ok(RoomState::SelectChart),
            1 => Ok(RoomState::WaitingForReady),
            2 => Ok(RoomState::Playing),
            tag => Err(WireError::UnknownTag {
                family: "room state",
                tag,
            }),
        }
    }
}

/// A user as presented to other room members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: i32,
    pub name: String,
    pub monitor: bool,
}

impl UserInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.id);
        write_string(buf, &self.name);
        write_bool(buf, self.monitor);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        Ok(Self {
            id: reader.i32()?,
            name: reader.string()?,
            monitor: reader.bool()?,
        })
    }
}

/// The full room snapshot sent to a user who authenticates while already
/// being a room member.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRoomState {
    pub id: String,
    pub state: RoomState,
    pub live: bool,
    pub locked: bool,
    pub cycle: bool,
    pub is_host: bool,
    pub is_ready: bool,
    pub users: HashMap<i32, UserInfo>,
    pub selected_chart: Option<i32>,
}

impl ClientRoomState {
    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.id);
        self.state.encode(buf);
        write_bool(buf, self.live);
        write_bool(buf, self.locked);
        write_bool(buf, self.cycle);
        write_bool(buf, self.is_host);
        write_bool(buf, self.is_ready);
        write_uleb128(buf, self.users.len() as u64);
        for (id, user) in &self.users {
            buf.put_i32_le(*id);
            user.encode(buf);
        }
        write_option_i32(buf, self.selected_chart);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        let id = reader.string()?;
        let state = RoomState::decode(reader)?;
        let live = reader.bool()?;
        let locked = reader.bool()?;
        let cycle = reader.bool()?;
        let is_host = reader.bool()?;
        let is_ready = reader.bool()?;
        let count = reader.count()?;
        let mut users = HashMap::with_capacity(count.min(64));
        for _ in 0..count {
            let key = reader.i32()?;
            users.insert(key, UserInfo::decode(reader)?);
        }
        let selected_chart = read_option_i32(reader)?;
        Ok(Self {
            id,
            state,
            live,
            locked,
            cycle,
            is_host,
            is_ready,
            users,
            selected_chart,
        })
    }
}

/// The payload of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRoomResponse {
    pub state: RoomState,
    pub users: Vec<UserInfo>,
    pub live: bool,
}

impl JoinRoomResponse {
    fn encode(&self, buf: &mut BytesMut) {
        self.state.encode(buf);
        write_uleb128(buf, self.users.len() as u64);
        for user in &self.users {
            user.encode(buf);
        }
        write_bool(buf, self.live);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        let state = RoomState::decode(reader)?;
        let count = reader.count()?;
        let mut users = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            users.push(UserInfo::decode(reader)?);
        }
        let live = reader.bool()?;
        Ok(Self { state, users, live })
    }
}

/// Events broadcast to every member of a room.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Chat { user: i32, content: String },
    CreateRoom { user: i32 },
    JoinRoom { user: i32, name: String },
    LeaveRoom { user: i32, name: String },
    NewHost { user: i32 },
    SelectChart { user: i32, name: String, id: i32 },
    GameStart { user: i32 },
    Ready { user: i32 },
    CancelReady { user: i32 },
    CancelGame { user: i32 },
    StartPlaying,
    Played { user: i32, score: i32, accuracy: f32, full_combo: bool },
    GameEnd,
    Abort { user: i32 },
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
}

impl Message {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Chat { user, content } => {
                buf.put_u8(0);
                buf.put_i32_le(*user);
                write_string(buf, content);
            }
            Message::CreateRoom { user } => {
                buf.put_u8(1);
                buf.put_i32_le(*user);
            }
            Message::JoinRoom { user, name } => {
                buf.put_u8(2);
                buf.put_i32_le(*user);
                write_string(buf, name);
            }
            Message::LeaveRoom { user, name } => {
                buf.put_u8(3);
                buf.put_i32_le(*user);
                write_string(buf, name);
            }
            Message::NewHost { user } => {
                buf.put_u8(4);
                buf.put_i32_le(*user);
            }
            Message::SelectChart { user, name, id } => {
                buf.put_u8(5);
                buf.put_i32_le(*user);
                write_string(buf, name);
                buf.put_i32_le(*id);
            }
            Message::GameStart { user } => {
                buf.put_u8(6);
                buf.put_i32_le(*user);
            }
            Message::Ready { user } => {
                buf.put_u8(7);
                buf.put_i32_le(*user);
            }
            Message::CancelReady { user } => {
                buf.put_u8(8);
                buf.put_i32_le(*user);
            }
            Message::CancelGame { user } => {
                buf.put_u8(9);
                buf.put_i32_le(*user);
            }
            Message::StartPlaying => {
                buf.put_u8(10);
            }
            Message::Played {
                user,
                score,
                accuracy,
                full_combo,
            } => {
                buf.put_u8(11);
                buf.put_i32_le(*user);
                buf.put_i32_le(*score);
                buf.put_f32_le(*accuracy);
                write_bool(buf, *full_combo);
            }
            Message::GameEnd => {
                buf.put_u8(12);
            }
            Message::Abort { user } => {
                buf.put_u8(13);
                buf.put_i32_le(*user);
            }
            Message::LockRoom { lock } => {
                buf.put_u8(14);
                write_bool(buf, *lock);
            }
            Message::CycleRoom { cycle } => {
                buf.put_u8(15);
                write_bool(buf, *cycle);
            }
        }
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        Ok(match reader.u8()? {
            0 => Message::Chat {
                user: reader.i32()?,
                content: reader.string()?,
            },
            1 => Message::CreateRoom { user: reader.i32()? },
            2 => Message::JoinRoom {
                user: reader.i32()?,
                name: reader.string()?,
            },
            3 => Message::LeaveRoom {
                user: reader.i32()?,
                name: reader.string()?,
            },
            4 => Message::NewHost { user: reader.i32()? },
            5 => Message::SelectChart {
                user: reader.i32()?,
                name: reader.string()?,
                id: reader.i32()?,
            },
            6 => Message::GameStart { user: reader.i32()? },
            7 => Message::Ready { user: reader.i32()? },
            8 => Message::CancelReady { user: reader.i32()? },
            9 => Message::CancelGame { user: reader.i32()? },
            10 => Message::StartPlaying,
            11 => Message::Played {
                user: reader.i32()?,
                score: reader.i32()?,
                accuracy: reader.f32()?,
                full_combo: reader.bool()?,
            },
            12 => Message::GameEnd,
            13 => Message::Abort { user: reader.i32()? },
            14 => Message::LockRoom {
                lock: reader.bool()?,
            },
            15 => Message::CycleRoom {
                cycle: reader.bool()?,
            },
            tag => {
                return Err(WireError::UnknownTag {
                    family: "message",
                    tag,
                });
            }
        })
    }
}

/// Commands sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping,
    Authenticate { token: String },
    Chat { message: String },
    Touches { frames: Vec<TouchFrame> },
    Judges { judges: Vec<JudgeEvent> },
    CreateRoom { id: String },
    JoinRoom { id: String, monitor: bool },
    LeaveRoom,
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
    SelectChart { id: i32 },
    RequestStart,
    Ready,
    CancelReady,
    Played { id: i32 },
    Abort,
}

impl ClientCommand {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientCommand::Ping => {
                buf.put_u8(0);
            }
            ClientCommand::Authenticate { token } => {
                buf.put_u8(1);
                write_string(buf, token);
            }
            ClientCommand::Chat { message } => {
                buf.put_u8(2);
                write_string(buf, message);
            }
            ClientCommand::Touches { frames } => {
                buf.put_u8(3);
                write_touch_frames(buf, frames);
            }
            ClientCommand::Judges { judges } => {
                buf.put_u8(4);
                write_judge_events(buf, judges);
            }
            ClientCommand::CreateRoom { id } => {
                buf.put_u8(5);
                write_string(buf, id);
            }
            ClientCommand::JoinRoom { id, monitor } => {
                buf.put_u8(6);
                write_string(buf, id);
                write_bool(buf, *monitor);
            }
            ClientCommand::LeaveRoom => {
                buf.put_u8(7);
            }
            ClientCommand::LockRoom { lock } => {
                buf.put_u8(8);
                write_bool(buf, *lock);
            }
            ClientCommand::CycleRoom { cycle } => {
                buf.put_u8(9);
                write_bool(buf, *cycle);
            }
            ClientCommand::SelectChart { id } => {
                buf.put_u8(10);
                buf.put_i32_le(*id);
            }
            ClientCommand::RequestStart => {
                buf.put_u8(11);
            }
            ClientCommand::Ready => {
                buf.put_u8(12);
            }
            ClientCommand::CancelReady => {
                buf.put_u8(13);
            }
            ClientCommand::Played { id } => {
                buf.put_u8(14);
                buf.put_i32_le(*id);
            }
            ClientCommand::Abort => {
                buf.put_u8(15);
            }
        }
    }

    pub fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        Ok(match reader.u8()? {
            0 => ClientCommand::Ping,
            1 => ClientCommand::Authenticate {
                token: reader.string()?,
            },
            2 => ClientCommand::Chat {
                message: reader.string()?,
            },
            3 => ClientCommand::Touches {
                frames: read_touch_frames(reader)?,
            },
            4 => ClientCommand::Judges {
                judges: read_judge_events(reader)?,
            },
            5 => ClientCommand::CreateRoom {
                id: reader.string()?,
            },
            6 => ClientCommand::JoinRoom {
                id: reader.string()?,
                monitor: reader.bool()?,
            },
            7 => ClientCommand::LeaveRoom,
            8 => ClientCommand::LockRoom {
                lock: reader.bool()?,
            },
            9 => ClientCommand::CycleRoom {
                cycle: reader.bool()?,
            },
            10 => ClientCommand::SelectChart { id: reader.i32()? },
            11 => ClientCommand::RequestStart,
            12 => ClientCommand::Ready,
            13 => ClientCommand::CancelReady,
            14 => ClientCommand::Played { id: reader.i32()? },
            15 => ClientCommand::Abort,
            tag => {
                return Err(WireError::UnknownTag {
                    family: "client command",
                    tag,
                });
            }
        })
    }
}

/// Commands sent by the server. Request/response pairs carry a
/// `Result<T, String>`: a success flag byte followed by the payload or a
/// human-readable error.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Pong,
    Authenticate(Result<(UserInfo, Option<ClientRoomState>), String>),
    Chat(Result<(), String>),
    Touches { player: i32, frames: Vec<TouchFrame> },
    Judges { player: i32, judges: Vec<JudgeEvent> },
    Message(Message),
    ChangeState { state: RoomState, chart: Option<i32> },
    ChangeHost(bool),
    CreateRoom(Result<(), String>),
    JoinRoom(Result<JoinRoomResponse, String>),
    OnJoinRoom(UserInfo),
    LeaveRoom(Result<(), String>),
    LockRoom(Result<(), String>),
    CycleRoom(Result<(), String>),
    SelectChart(Result<(), String>),
    RequestStart(Result<(), String>),
    Ready(Result<(), String>),
    CancelReady(Result<(), String>),
    Played(Result<(), String>),
    Abort(Result<(), String>),
}

impl ServerCommand {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerCommand::Pong => {
                buf.put_u8(0);
            }
            ServerCommand::Authenticate(res) => {
                buf.put_u8(1);
                write_result(buf, res, |buf, (user, room)| {
                    user.encode(buf);
                    match room {
                        Some(room) => {
                            write_bool(buf, true);
                            room.encode(buf);
                        }
                        None => write_bool(buf, false),
                    }
                });
            }
            ServerCommand::Chat(res) => {
                buf.put_u8(2);
                write_unit_result(buf, res);
            }
            ServerCommand::Touches { player, frames } => {
                buf.put_u8(3);
                buf.put_i32_le(*player);
                write_touch_frames(buf, frames);
            }
            ServerCommand::Judges { player, judges } => {
                buf.put_u8(4);
                buf.put_i32_le(*player);
                write_judge_events(buf, judges);
            }
            ServerCommand::Message(message) => {
                buf.put_u8(5);
                message.encode(buf);
            }
            ServerCommand::ChangeState { state, chart } => {
                buf.put_u8(6);
                state.encode(buf);
                // The chart id travels only while the room is back in
                // chart selection.
                if *state == RoomState::SelectChart {
                    write_option_i32(buf, *chart);
                }
            }
            ServerCommand::ChangeHost(is_host) => {
                buf.put_u8(7);
                write_bool(buf, *is_host);
            }
            ServerCommand::CreateRoom(res) => {
                buf.put_u8(8);
                write_unit_result(buf, res);
            }
            ServerCommand::JoinRoom(res) => {
                buf.put_u8(9);
                write_result(buf, res, |buf, resp| resp.encode(buf));
            }
            ServerCommand::OnJoinRoom(user) => {
                buf.put_u8(10);
                user.encode(buf);
            }
            ServerCommand::LeaveRoom(res) => {
                buf.put_u8(11);
                write_unit_result(buf, res);
            }
            ServerCommand::LockRoom(res) => {
                buf.put_u8(12);
                write_unit_result(buf, res);
            }
            ServerCommand::CycleRoom(res) => {
                buf.put_u8(13);
                write_unit_result(buf, res);
            }
            ServerCommand::SelectChart(res) => {
                buf.put_u8(14);
                write_unit_result(buf, res);
            }
            ServerCommand::RequestStart(res) => {
                buf.put_u8(15);
                write_unit_result(buf, res);
            }
            ServerCommand::Ready(res) => {
                buf.put_u8(16);
                write_unit_result(buf, res);
            }
            ServerCommand::CancelReady(res) => {
                buf.put_u8(17);
                write_unit_result(buf, res);
            }
            ServerCommand::Played(res) => {
                buf.put_u8(18);
                write_unit_result(buf, res);
            }
            ServerCommand::Abort(res) => {
                buf.put_u8(19);
                write_unit_result(buf, res);
            }
        }
    }

    pub fn decode(reader: &mut ByteReader) -> Result<Self, WireError> {
        Ok(match reader.u8()? {
            0 => ServerCommand::Pong,
            1 => ServerCommand::Authenticate(read_result(reader, |reader| {
                let user = UserInfo::decode(reader)?;
                let room = if reader.bool()? {
                    Some(ClientRoomState::decode(reader)?)
                } else {
                    None
                };
                Ok((user, room))
            })?),
            2 => ServerCommand::Chat(read_unit_result(reader)?),
            3 => ServerCommand::Touches {
                player: reader.i32()?,
                frames: read_touch_frames(reader)?,
            },
            4 => ServerCommand::Judges {
                player: reader.i32()?,
                judges: read_judge_events(reader)?,
            },
            5 => ServerCommand::Message(Message::decode(reader)?),
            6 => {
                let state = RoomState::decode(reader)?;
                let chart = if state == RoomState::SelectChart {
                    read_option_i32(reader)?
                } else {
                    None
                };
                ServerCommand::ChangeState { state, chart }
            }
            7 => ServerCommand::ChangeHost(reader.bool()?),
            8 => ServerCommand::CreateRoom(read_unit_result(reader)?),
            9 => ServerCommand::JoinRoom(read_result(reader, JoinRoomResponse::decode)?),
            10 => ServerCommand::OnJoinRoom(UserInfo::decode(reader)?),
            11 => ServerCommand::LeaveRoom(read_unit_result(reader)?),
            12 => ServerCommand::LockRoom(read_unit_result(reader)?),
            13 => ServerCommand::CycleRoom(read_unit_result(reader)?),
            14 => ServerCommand::SelectChart(read_unit_result(reader)?),
            15 => ServerCommand::RequestStart(read_unit_result(reader)?),
            16 => ServerCommand::Ready(read_unit_result(reader)?),
            17 => ServerCommand::CancelReady(read_unit_result(reader)?),
            18 => ServerCommand::Played(read_unit_result(reader)?),
            19 => ServerCommand::Abort(read_unit_result(reader)?),
            tag => {
                return Err(WireError::UnknownTag {
                    family: "server command",
                    tag,
                });
            }
        })
    }
}

fn write_option_i32(buf: &mut BytesMut, value: Option<i32>) {
    match value {
        Some(value) => {
            write_bool(buf, true);
            buf.put_i32_le(value);
        }
        None => write_bool(buf, false),
    }
}

fn read_option_i32(reader: &mut ByteReader) -> Result<Option<i32>, WireError> {
    Ok(if reader.bool()? {
        Some(reader.i32()?)
    } else {
        None
    })
}

fn write_result<T>(
    buf: &mut BytesMut,
    res: &Result<T, String>,
    write_ok: impl FnOnce(&mut BytesMut, &T),
) {
    match res {
        Ok(value) => {
            write_bool(buf, true);
            write_ok(buf, value);
        }
        Err(error) => {
            write_bool(buf, false);
            write_string(buf, error);
        }
    }
}

fn read_result<T>(
    reader: &mut ByteReader,
    read_ok: impl FnOnce(&mut ByteReader) -> Result<T, WireError>,
) -> Result<Result<T, String>, WireError> {
    if reader.bool()? {
        Ok(Ok(read_ok(reader)?))
    } else {
        Ok(Err(reader.string()?))
    }
}

fn write_unit_result(buf: &mut BytesMut, res: &Result<(), String>) {
    write_result(buf, res, |_, ()| {});
}

fn read_unit_result(reader: &mut ByteReader) -> Result<Result<(), String>, WireError> {
    read_result(reader, |_| Ok(()))
}

fn write_touch_frames(buf: &mut BytesMut, frames: &[TouchFrame]) {
    write_uleb128(buf, frames.len() as u64);
    for frame in frames {
        buf.put_f32_le(frame.time);
        write_uleb128(buf, frame.points.len() as u64);
        for point in &frame.points {
            buf.put_i8(point.id);
            write_f16(buf, point.x);
            write_f16(buf, point.y);
        }
    }
}

fn read_touch_frames(reader: &mut ByteReader) -> Result<Vec<TouchFrame>, WireError> {
    let count = reader.count()?;
    let mut frames = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let time = reader.f32()?;
        let point_count = reader.count()?;
        let mut points = Vec::with_capacity(point_count.min(64));
        for _ in 0..point_count {
            points.push(TouchPoint {
                id: reader.i8()?,
                x: reader.f16()?,
                y: reader.f16()?,
            });
        }
        frames.push(TouchFrame { time, points });
    }
    Ok(frames)
}

fn write_judge_events(buf: &mut BytesMut, judges: &[JudgeEvent]) {
    write_uleb128(buf, judges.len() as u64);
    for judge in judges {
        buf.put_f32_le(judge.time);
        buf.put_u32_le(judge.line_id);
        buf.put_u32_le(judge.note_id);
        buf.put_u8(judge.judgement);
    }
}

fn read_judge_events(reader: &mut ByteReader) -> Result<Vec<JudgeEvent>, WireError> {
    let count = reader.count()?;
    let mut judges = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        judges.push(JudgeEvent {
            time: reader.f32()?,
            line_id: reader.u32()?,
            note_id: reader.u32()?,
            judgement: reader.u8()?,
        });
    }
    Ok(judges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_round_trip(cmd: ClientCommand) {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        let mut reader = ByteReader::new(&buf);
        let decoded = ClientCommand::decode(&mut reader).unwrap();
        assert!(reader.is_empty(), "trailing bytes after {cmd:?}");
        assert_eq!(decoded, cmd);
    }

    fn server_round_trip(cmd: ServerCommand) {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        let mut reader = ByteReader::new(&buf);
        let decoded = ServerCommand::decode(&mut reader).unwrap();
        assert!(reader.is_empty(), "trailing bytes after {cmd:?}");
        assert_eq!(decoded, cmd);
    }

    fn sample_frames() -> Vec<TouchFrame> {
        vec![
            TouchFrame {
                time: 1.25,
                points: vec![
                    TouchPoint {
                        id: 0,
                        x: f16::from_f32(0.5),
                        y: f16::from_f32(-0.25),
                    },
                    TouchPoint {
                        id: -1,
                        x: f16::from_f32(1.0),
                        y: f16::from_f32(0.0),
                    },
                ],
            },
            TouchFrame {
                time: 1.5,
                points: Vec::new(),
            },
        ]
    }

    fn sample_judges() -> Vec<JudgeEvent> {
        vec![
            JudgeEvent {
                time: 2.0,
                line_id: 3,
                note_id: 17,
                judgement: 1,
            },
            JudgeEvent {
                time: 2.5,
                line_id: 0,
                note_id: 18,
                judgement: 4,
            },
        ]
    }

    fn sample_room_state() -> ClientRoomState {
        ClientRoomState {
            id: "52A7F1".to_owned(),
            state: RoomState::WaitingForReady,
            live: true,
            locked: false,
            cycle: true,
            is_host: false,
            is_ready: true,
            users: [
                (
                    42,
                    UserInfo {
                        id: 42,
                        name: "Alice".to_owned(),
                        monitor: false,
                    },
                ),
                (
                    7,
                    UserInfo {
                        id: 7,
                        name: "观察者".to_owned(),
                        monitor: true,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            selected_chart: Some(100),
        }
    }

    #[test]
    fn every_client_command_round_trips() {
        for cmd in [
            ClientCommand::Ping,
            ClientCommand::Authenticate {
                token: "secret-token".to_owned(),
            },
            ClientCommand::Chat {
                message: "hello".to_owned(),
            },
            ClientCommand::Touches {
                frames: sample_frames(),
            },
            ClientCommand::Judges {
                judges: sample_judges(),
            },
            ClientCommand::CreateRoom {
                id: "0".to_owned(),
            },
            ClientCommand::JoinRoom {
                id: "52A7F1".to_owned(),
                monitor: true,
            },
            ClientCommand::LeaveRoom,
            ClientCommand::LockRoom { lock: true },
            ClientCommand::CycleRoom { cycle: false },
            ClientCommand::SelectChart { id: -5 },
            ClientCommand::RequestStart,
            ClientCommand::Ready,
            ClientCommand::CancelReady,
            ClientCommand::Played { id: 7 },
            ClientCommand::Abort,
        ] {
            client_round_trip(cmd);
        }
    }

    #[test]
    fn every_server_command_round_trips() {
        let user = UserInfo {
            id: 42,
            name: "Alice".to_owned(),
            monitor: false,
        };
        for cmd in [
            ServerCommand::Pong,
            ServerCommand::Authenticate(Ok((user.clone(), Some(sample_room_state())))),
            ServerCommand::Authenticate(Ok((user.clone(), None))),
            ServerCommand::Authenticate(Err("invalid token".to_owned())),
            ServerCommand::Chat(Ok(())),
            ServerCommand::Chat(Err("not in a room".to_owned())),
            ServerCommand::Touches {
                player: 42,
                frames: sample_frames(),
            },
            ServerCommand::Judges {
                player: 42,
                judges: sample_judges(),
            },
            ServerCommand::Message(Message::NewHost { user: 42 }),
            ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart: Some(100),
            },
            ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart: None,
            },
            ServerCommand::ChangeState {
                state: RoomState::Playing,
                chart: None,
            },
            ServerCommand::ChangeHost(true),
            ServerCommand::CreateRoom(Ok(())),
            ServerCommand::JoinRoom(Ok(JoinRoomResponse {
                state: RoomState::SelectChart,
                users: vec![user.clone()],
                live: false,
            })),
            ServerCommand::JoinRoom(Err("room is locked".to_owned())),
            ServerCommand::OnJoinRoom(user),
            ServerCommand::LeaveRoom(Ok(())),
            ServerCommand::LockRoom(Ok(())),
            ServerCommand::CycleRoom(Ok(())),
            ServerCommand::SelectChart(Err("not the host".to_owned())),
            ServerCommand::RequestStart(Ok(())),
            ServerCommand::Ready(Ok(())),
            ServerCommand::CancelReady(Ok(())),
            ServerCommand::Played(Ok(())),
            ServerCommand::Abort(Ok(())),
        ] {
            server_round_trip(cmd);
        }
    }

    #[test]
    fn every_message_round_trips() {
        for message in [
            Message::Chat {
                user: 42,
                content: "gg".to_owned(),
            },
            Message::CreateRoom { user: 42 },
            Message::JoinRoom {
                user: 7,
                name: "Bob".to_owned(),
            },
            Message::LeaveRoom {
                user: 7,
                name: "Bob".to_owned(),
            },
            Message::NewHost { user: 7 },
            Message::SelectChart {
                user: 42,
                name: "Spasmodic".to_owned(),
                id: 100,
            },
            Message::GameStart { user: 42 },
            Message::Ready { user: 7 },
            Message::CancelReady { user: 7 },
            Message::CancelGame { user: 42 },
            Message::StartPlaying,
            Message::Played {
                user: 42,
                score: 987654,
                accuracy: 0.98,
                full_combo: true,
            },
            Message::GameEnd,
            Message::Abort { user: 7 },
            Message::LockRoom { lock: true },
            Message::CycleRoom { cycle: false },
        ] {
            let mut buf = BytesMut::new();
            message.encode(&mut buf);
            let mut reader = ByteReader::new(&buf);
            assert_eq!(Message::decode(&mut reader).unwrap(), message);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn unknown_tags_are_fatal() {
        let mut reader = ByteReader::new(&[16]);
        assert_eq!(
            ClientCommand::decode(&mut reader),
            Err(WireError::UnknownTag {
                family: "client command",
                tag: 16
            })
        );
        let mut reader = ByteReader::new(&[20]);
        assert_eq!(
            ServerCommand::decode(&mut reader),
            Err(WireError::UnknownTag {
                family: "server command",
                tag: 20
            })
        );
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let mut buf = BytesMut::new();
        ClientCommand::Authenticate {
            token: "abcdef".to_owned(),
        }
        .encode(&mut buf);
        buf.truncate(buf.len() - 2);
        let mut reader = ByteReader::new(&buf);
        assert_eq!(
            ClientCommand::decode(&mut reader),
            Err(WireError::UnexpectedEof)
        );
    }
}
