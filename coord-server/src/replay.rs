//! Replay recording. While a room is playing, every player owns one
//! append-only `.phirarec` file that receives their raw touch and
//! judgement command payloads as they arrive. The 14-byte header carries
//! the record id, patched in place once the play record is validated.

use chrono::Utc;
use protocol::ClientCommand;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// "PM", little-endian, leading the header.
const MAGIC: u16 = 0x504D;
/// Byte offset of the record id inside the header.
const RECORD_ID_OFFSET: u64 = 10;
/// Replays older than this are deleted by the daily retention sweep.
pub const RETENTION: Duration = Duration::from_secs(4 * 24 * 60 * 60);

pub struct ReplayWriter {
    /// `None` once disposed or after a write error; all operations become
    /// no-ops from then on.
    file: Option<File>,
    path: PathBuf,
}

impl ReplayWriter {
    /// Opens `<base>/record/<user>/<chart>/<now_ms>.phirarec` and writes
    /// the header with a zero record id.
    pub async fn create(base: &Path, user_id: i32, chart_id: i32) -> std::io::Result<Self> {
        let dir = base
            .join("record")
            .join(user_id.to_string())
            .join(chart_id.to_string());
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.phirarec", Utc::now().timestamp_millis()));

        let mut header = [0u8; 14];
        header[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        header[2..6].copy_from_slice(&(chart_id as u32).to_le_bytes());
        header[6..10].copy_from_slice(&(user_id as u32).to_le_bytes());
        // Bytes 10..14 stay zero until the record id is known.

        let mut file = File::create(&path).await?;
        file.write_all(&header).await?;
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Appends one raw-serialized command (tag byte + body). Input replay
    /// streams are recorded in arrival order with no reordering.
    pub async fn append(&mut self, cmd: &ClientCommand) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut payload = bytes::BytesMut::new();
        cmd.encode(&mut payload);
        if let Err(err) = file.write_all(&payload).await {
            tracing::warn!(?err, path = %self.path.display(), "replay append failed, closing writer");
            self.file = None;
        }
    }

    /// Patches the record id into the header, restoring the append
    /// position afterwards.
    pub async fn update_record_id(&mut self, record_id: i32) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = async {
            file.seek(SeekFrom::Start(RECORD_ID_OFFSET)).await?;
            file.write_all(&(record_id as u32).to_le_bytes()).await?;
            file.seek(SeekFrom::End(0)).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(?err, path = %self.path.display(), "replay header patch failed, closing writer");
            self.file = None;
        }
    }

    /// Flushes and closes. Idempotent; subsequent writes are no-ops.
    pub async fn dispose(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush().await {
                tracing::warn!(?err, path = %self.path.display(), "replay flush failed on dispose");
            }
        }
    }
}

/// Deletes replays whose filename timestamp is older than [`RETENTION`],
/// then prunes directories left empty. Runs once per day.
pub async fn sweep_expired(base: &Path) {
    let cutoff = Utc::now().timestamp_millis() - RETENTION.as_millis() as i64;
    let record_root = base.join("record");
    let Ok(mut user_dirs) = fs::read_dir(&record_root).await else {
        return;
    };
    while let Ok(Some(user_dir)) = user_dirs.next_entry().await {
        let Ok(mut chart_dirs) = fs::read_dir(user_dir.path()).await else {
            continue;
        };
        while let Ok(Some(chart_dir)) = chart_dirs.next_entry().await {
            let Ok(mut replays) = fs::read_dir(chart_dir.path()).await else {
                continue;
            };
            while let Ok(Some(replay)) = replays.next_entry().await {
                if replay_timestamp(&replay.path()).is_some_and(|ts| ts < cutoff) {
                    if let Err(err) = fs::remove_file(replay.path()).await {
                        tracing::warn!(?err, path = %replay.path().display(), "failed to delete expired replay");
                    }
                }
            }
            // Empty chart directories go as well; remove_dir fails on
            // non-empty ones, which is exactly what we want.
            let _ = fs::remove_dir(chart_dir.path()).await;
        }
        let _ = fs::remove_dir(user_dir.path()).await;
    }
}

/// Parses the millisecond timestamp out of `<ts>.phirarec`.
fn replay_timestamp(path: &Path) -> Option<i64> {
    if path.extension()? != "phirarec" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Lists a user's replays grouped by chart id, newest first within each
/// chart. Serves the replay download listing.
pub async fn list_for_user(base: &Path, user_id: i32) -> Vec<(i32, Vec<i64>)> {
    let user_root = base.join("record").join(user_id.to_string());
    let mut result = Vec::new();
    let Ok(mut chart_dirs) = fs::read_dir(&user_root).await else {
        return result;
    };
    while let Ok(Some(chart_dir)) = chart_dirs.next_entry().await {
        let Some(chart_id) = chart_dir
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let mut timestamps = Vec::new();
        let Ok(mut replays) = fs::read_dir(chart_dir.path()).await else {
            continue;
        };
        while let Ok(Some(replay)) = replays.next_entry().await {
            if let Some(ts) = replay_timestamp(&replay.path()) {
                timestamps.push(ts);
            }
        }
        if !timestamps.is_empty() {
            timestamps.sort_unstable_by(|a, b| b.cmp(a));
            result.push((chart_id, timestamps));
        }
    }
    result.sort_unstable_by_key(|(chart_id, _)| *chart_id);
    result
}

/// Resolves the on-disk path of one replay.
pub fn replay_path(base: &Path, user_id: i32, chart_id: i32, timestamp: i64) -> PathBuf {
    base.join("record")
        .join(user_id.to_string())
        .join(chart_id.to_string())
        .join(format!("{timestamp}.phirarec"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_layout_and_record_id_patch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ReplayWriter::create(dir.path(), 42, 100).await.unwrap();

        writer
            .append(&ClientCommand::Judges {
                judges: vec![protocol::JudgeEvent {
                    time: 1.0,
                    line_id: 2,
                    note_id: 3,
                    judgement: 1,
                }],
            })
            .await;
        writer.update_record_id(7).await;
        let path = writer.path.clone();
        writer.dispose().await;
        // Disposing twice is fine, as are writes afterwards.
        writer.dispose().await;
        writer.append(&ClientCommand::Ping).await;

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..2], &0x504Du16.to_le_bytes());
        assert_eq!(&raw[2..6], &100u32.to_le_bytes());
        assert_eq!(&raw[6..10], &42u32.to_le_bytes());
        assert_eq!(&raw[10..14], &7u32.to_le_bytes());
        // The judge payload sits after the header: tag 4, count 1, event.
        assert_eq!(raw[14], 4);
        assert_eq!(raw[15], 1);
        assert_eq!(raw.len(), 14 + 2 + 13);
    }

    #[tokio::test]
    async fn retention_sweep_deletes_old_files_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = dir.path().join("record").join("42").join("100");
        std::fs::create_dir_all(&chart_dir).unwrap();

        let now = Utc::now().timestamp_millis();
        let old = now - RETENTION.as_millis() as i64 - 1_000;
        let old_path = chart_dir.join(format!("{old}.phirarec"));
        let new_path = chart_dir.join(format!("{now}.phirarec"));
        std::fs::write(&old_path, b"old").unwrap();
        std::fs::write(&new_path, b"new").unwrap();

        sweep_expired(dir.path()).await;
        assert!(!old_path.exists());
        assert!(new_path.exists());
        assert!(chart_dir.exists());

        std::fs::remove_file(&new_path).unwrap();
        sweep_expired(dir.path()).await;
        assert!(!chart_dir.exists());
        assert!(!dir.path().join("record").join("42").exists());
    }

    #[tokio::test]
    async fn listing_groups_by_chart() {
        let dir = tempfile::tempdir().unwrap();
        for (chart, ts) in [(100, 1111), (100, 2222), (7, 3333)] {
            let chart_dir = dir.path().join("record").join("42").join(chart.to_string());
            std::fs::create_dir_all(&chart_dir).unwrap();
            std::fs::write(chart_dir.join(format!("{ts}.phirarec")), b"x").unwrap();
        }
        let listing = list_for_user(dir.path(), 42).await;
        assert_eq!(listing, vec![(7, vec![3333]), (100, vec![2222, 1111])]);
        assert!(list_for_user(dir.path(), 9).await.is_empty());
    }
}
