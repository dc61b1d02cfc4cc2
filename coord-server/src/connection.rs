//! Per-connection send/receive pipeline for the game TCP stream.
//!
//! Each accepted socket gets an unbounded send queue drained by a single
//! sender task (so writes are strictly ordered and never interleave), a
//! receiver task that turns frames into dispatched commands, and a
//! last-activity timestamp for the heartbeat. `close` cancels both tasks,
//! drops whatever is still queued and is idempotent.

use anyhow::bail;
use bytes::BytesMut;
use protocol::{ByteReader, ClientCommand, ServerCommand, check_frame_len, write_uleb128};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub struct Connection {
    send_tx: UnboundedSender<ServerCommand>,
    last_receive: Mutex<Instant>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(send_tx: UnboundedSender<ServerCommand>) -> Self {
        Self {
            send_tx,
            last_receive: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Tasks registered here are aborted by [`Connection::close`].
    pub fn register_task(&self, handle: JoinHandle<()>) {
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        self.tasks.lock().unwrap().push(handle);
    }

    /// Enqueues a command. Silently dropped once the connection closed.
    pub fn send(&self, cmd: ServerCommand) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.send_tx.send(cmd);
    }

    /// A clone of the send queue for binding to a user.
    pub fn sender(&self) -> UnboundedSender<ServerCommand> {
        self.send_tx.clone()
    }

    /// Records inbound activity for the heartbeat.
    pub fn touch(&self) {
        *self.last_receive.lock().unwrap() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_receive.lock().unwrap().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancels both pipeline tasks and thereby drops the socket halves.
    /// Idempotent. A task calling this on its own connection keeps running
    /// until its next await point, so cleanup code must not await afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// The sender task: dequeues one command at a time, serializes it, writes
/// the ULEB128 length prefix and the payload, then flushes.
pub async fn run_sender(mut write: OwnedWriteHalf, mut rx: UnboundedReceiver<ServerCommand>) {
    let mut header = BytesMut::with_capacity(8);
    let mut payload = BytesMut::with_capacity(1024);
    while let Some(cmd) = rx.recv().await {
        header.clear();
        payload.clear();
        cmd.encode(&mut payload);
        write_uleb128(&mut header, payload.len() as u64);
        let result = async {
            write.write_all(&header).await?;
            write.write_all(&payload).await?;
            write.flush().await
        }
        .await;
        if let Err(err) = result {
            tracing::debug!(?err, "game stream write failed");
            return;
        }
    }
}

/// Reads one frame and decodes it into a client command. Any error is
/// fatal for the stream: oversize length, overlong varint, EOF mid-frame,
/// unknown tag, or payload bytes left over after the command.
pub async fn read_command(
    read: &mut OwnedReadHalf,
    scratch: &mut Vec<u8>,
) -> anyhow::Result<ClientCommand> {
    let mut length: u64 = 0;
    let mut terminated = false;
    for shift in (0..64).step_by(7) {
        let byte = read.read_u8().await?;
        let bits = u64::from(byte & 0x7f);
        if shift == 63 && bits > 1 {
            bail!("frame length varint overflows 64 bits");
        }
        length |= bits << shift;
        if byte & 0x80 == 0 {
            terminated = true;
            break;
        }
    }
    if !terminated {
        bail!("frame length varint does not terminate");
    }
    let len = check_frame_len(length)?;

    scratch.resize(len, 0);
    read.read_exact(scratch).await?;

    let mut reader = ByteReader::new(scratch);
    let cmd = ClientCommand::decode(&mut reader)?;
    if !reader.is_empty() {
        bail!("{} trailing bytes after command", reader.remaining());
    }
    Ok(cmd)
}
