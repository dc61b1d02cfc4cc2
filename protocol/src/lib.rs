//! Wire protocol shared between the coordination server and its clients.
//!
//! Every message on the game TCP stream is one *frame*: a ULEB128 payload
//! length followed by exactly that many payload bytes. The payload is a
//! single tagged command from either the client or the server family. The
//! one exception is the very first byte of a fresh connection, which is the
//! protocol version and travels outside any frame.

mod codec;
mod commands;
mod varint;

pub use codec::{ByteReader, WireError, write_bool, write_f16, write_string};
pub use commands::{
    ClientCommand, ClientRoomState, JoinRoomResponse, JudgeEvent, Message, RoomState,
    ServerCommand, TouchFrame, TouchPoint, UserInfo,
};
pub use varint::{read_uleb128, read_uleb128_u32, write_uleb128};

use std::time::Duration;

/// Receivers reject any frame whose announced payload length exceeds this.
pub const MAX_FRAME_SIZE: u32 = 2 * 1024 * 1024;

/// The newest protocol version this crate understands.
pub const PROTOCOL_VERSION: u8 = 1;

/// Cadence of the per-session liveness check on the game stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A session whose last inbound frame is older than this is dropped. Note
/// that the deadline equals the tick.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence and deadline of the WebSocket-side heartbeat.
pub const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_GAME_PORT: u16 = 12346;
pub const DEFAULT_HTTP_PORT: u16 = 12347;

/// Validates a frame length read off the wire.
pub fn check_frame_len(len: u64) -> Result<usize, WireError> {
    if len > u64::from(MAX_FRAME_SIZE) {
        return Err(WireError::FrameTooLarge(len));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_guard() {
        assert_eq!(check_frame_len(0), Ok(0));
        assert_eq!(
            check_frame_len(u64::from(MAX_FRAME_SIZE)),
            Ok(MAX_FRAME_SIZE as usize)
        );
        assert_eq!(
            check_frame_len(u64::from(MAX_FRAME_SIZE) + 1),
            Err(WireError::FrameTooLarge(u64::from(MAX_FRAME_SIZE) + 1))
        );
    }
}
