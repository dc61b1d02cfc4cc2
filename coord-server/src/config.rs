//! Server configuration: a `config.json` next to the working directory plus
//! a handful of environment overrides for containerized deployments.

use anyhow::{Context, Result};
use protocol::{DEFAULT_GAME_PORT, DEFAULT_HTTP_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub game_port: u16,
    pub http_port: u16,
    pub server_name: String,
    /// Chat line sent shortly after a successful authentication. Empty
    /// disables the welcome entirely.
    pub welcome_message: String,
    pub http_service: bool,
    /// Permanent admin token. When set, the OTP flow is disabled.
    pub admin_token: Option<String>,
    /// Read-only admin token, admitted for GET requests only.
    pub view_token: Option<String>,
    pub admin_data_path: String,
    /// Base URL of the external identity / chart / record service.
    pub api_base: String,
    /// Directory under which `record/<user>/<chart>/*.phirarec` files live.
    pub record_dir: String,
    /// User id whose welcome message is suppressed.
    pub suppress_welcome_for: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game_port: DEFAULT_GAME_PORT,
            http_port: DEFAULT_HTTP_PORT,
            server_name: "coord-server".to_owned(),
            welcome_message: String::new(),
            http_service: true,
            admin_token: None,
            view_token: None,
            admin_data_path: "admin_data.json".to_owned(),
            api_base: "https://api.phira.cn".to_owned(),
            record_dir: ".".to_owned(),
            suppress_welcome_for: None,
        }
    }
}

impl Config {
    /// Loads `config.json` if present, then applies environment overrides.
    /// A missing file means defaults; a malformed one is a startup error.
    pub fn load() -> Result<Self> {
        let mut config = match std::fs::read_to_string("config.json") {
            Ok(raw) => serde_json::from_str(&raw).context("failed to parse config.json")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err).context("failed to read config.json"),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies the environment overrides through an injectable lookup so
    /// tests stay independent of the process environment.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("HTTP_SERVICE") {
            self.http_service = !matches!(value.as_str(), "0" | "false" | "off");
        }
        if let Some(value) = get("HTTP_PORT")
            && let Ok(port) = value.parse()
        {
            self.http_port = port;
        }
        if let Some(value) = get("ADMIN_TOKEN")
            && !value.is_empty()
        {
            self.admin_token = Some(value);
        }
        if let Some(value) = get("ADMIN_DATA_PATH") {
            self.admin_data_path = value;
        } else if let Some(home) = get("PHIRA_MP_HOME") {
            self.admin_data_path = Path::new(&home)
                .join("admin_data.json")
                .to_string_lossy()
                .into_owned();
            if self.record_dir == "." {
                self.record_dir = home;
            }
        }
    }

    pub fn admin_data_path(&self) -> PathBuf {
        PathBuf::from(&self.admin_data_path)
    }

    pub fn record_dir(&self) -> PathBuf {
        PathBuf::from(&self.record_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.game_port, 12346);
        assert_eq!(config.http_port, 12347);
        assert!(config.http_service);
        assert_eq!(config.admin_data_path, "admin_data.json");
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("HTTP_SERVICE", "false"),
            ("HTTP_PORT", "8123"),
            ("ADMIN_TOKEN", "sekrit"),
            ("ADMIN_DATA_PATH", "/data/bans.json"),
        ]));
        assert!(!config.http_service);
        assert_eq!(config.http_port, 8123);
        assert_eq!(config.admin_token.as_deref(), Some("sekrit"));
        assert_eq!(config.admin_data_path, "/data/bans.json");
    }

    #[test]
    fn home_fallback_places_admin_data_and_records() {
        let mut config = Config::default();
        config.apply_env(env(&[("PHIRA_MP_HOME", "/srv/mp")]));
        assert_eq!(config.admin_data_path, "/srv/mp/admin_data.json");
        assert_eq!(config.record_dir, "/srv/mp");
    }

    #[test]
    fn explicit_path_beats_home() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("PHIRA_MP_HOME", "/srv/mp"),
            ("ADMIN_DATA_PATH", "/elsewhere/bans.json"),
        ]));
        assert_eq!(config.admin_data_path, "/elsewhere/bans.json");
    }

    #[test]
    fn config_json_round_trips() {
        let raw = r#"{"gamePort":2000,"serverName":"test","welcomeMessage":"hi","adminToken":"t"}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.game_port, 2000);
        assert_eq!(config.server_name, "test");
        assert_eq!(config.welcome_message, "hi");
        assert_eq!(config.admin_token.as_deref(), Some("t"));
        // Unspecified fields fall back to defaults.
        assert_eq!(config.http_port, 12347);
    }
}
