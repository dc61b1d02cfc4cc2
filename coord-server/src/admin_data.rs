//! On-disk admin ban tables. The whole document is rewritten on every
//! mutation through a temp-file rename, so the file on disk is always a
//! complete serialization of some consistent state.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BanTables {
    user_bans: HashSet<i64>,
    room_bans: HashMap<String, HashSet<i64>>,
}

pub struct AdminData {
    path: PathBuf,
    tables: std::sync::RwLock<BanTables>,
    /// Serializes saves so two concurrent mutations cannot interleave
    /// their temp-file writes.
    save_gate: Mutex<()>,
}

impl AdminData {
    /// Loads the ban tables, starting empty when the file does not exist.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let tables = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("failed to parse {}: {err}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BanTables::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            tables: std::sync::RwLock::new(tables),
            save_gate: Mutex::new(()),
        })
    }

    pub fn is_user_banned(&self, user_id: i64) -> bool {
        self.tables.read().unwrap().user_bans.contains(&user_id)
    }

    pub fn is_room_banned(&self, room_id: &str, user_id: i64) -> bool {
        self.tables
            .read()
            .unwrap()
            .room_bans
            .get(room_id)
            .is_some_and(|set| set.contains(&user_id))
    }

    /// Returns whether the table changed.
    pub async fn set_user_ban(&self, user_id: i64, banned: bool) -> bool {
        let changed = {
            let mut tables = self.tables.write().unwrap();
            if banned {
                tables.user_bans.insert(user_id)
            } else {
                tables.user_bans.remove(&user_id)
            }
        };
        if changed {
            self.save().await;
        }
        changed
    }

    pub async fn set_room_ban(&self, room_id: &str, user_id: i64, banned: bool) -> bool {
        let changed = {
            let mut tables = self.tables.write().unwrap();
            if banned {
                tables
                    .room_bans
                    .entry(room_id.to_owned())
                    .or_default()
                    .insert(user_id)
            } else {
                match tables.room_bans.get_mut(room_id) {
                    Some(set) => {
                        let removed = set.remove(&user_id);
                        if set.is_empty() {
                            tables.room_bans.remove(room_id);
                        }
                        removed
                    }
                    None => false,
                }
            }
        };
        if changed {
            self.save().await;
        }
        changed
    }

    /// Persists a snapshot of the tables. Failures are logged; the
    /// in-memory state keeps the mutation either way.
    async fn save(&self) {
        let _gate = self.save_gate.lock().await;
        let snapshot = self.tables.read().unwrap().clone();
        let raw = match serde_json::to_vec_pretty(&snapshot) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(?err, "failed to serialize admin data");
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &raw).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(err) = result {
            tracing::error!(?err, path = %self.path.display(), "failed to save admin data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bans_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin_data.json");

        let data = AdminData::load(path.clone()).unwrap();
        assert!(!data.is_user_banned(42));
        assert!(data.set_user_ban(42, true).await);
        assert!(data.set_room_ban("52A7F1", 7, true).await);
        assert!(data.is_user_banned(42));
        assert!(data.is_room_banned("52A7F1", 7));
        assert!(!data.is_room_banned("52A7F1", 8));

        // A fresh load sees the persisted state.
        let reloaded = AdminData::load(path).unwrap();
        assert!(reloaded.is_user_banned(42));
        assert!(reloaded.is_room_banned("52A7F1", 7));
        assert!(!reloaded.is_room_banned("other", 7));
    }

    #[tokio::test]
    async fn unban_removes_and_reports_change() {
        let dir = tempfile::tempdir().unwrap();
        let data = AdminData::load(dir.path().join("admin_data.json")).unwrap();
        assert!(data.set_user_ban(1, true).await);
        assert!(!data.set_user_ban(1, true).await);
        assert!(data.set_user_ban(1, false).await);
        assert!(!data.is_user_banned(1));

        assert!(data.set_room_ban("r", 1, true).await);
        assert!(data.set_room_ban("r", 1, false).await);
        assert!(!data.set_room_ban("r", 1, false).await);
    }
}
