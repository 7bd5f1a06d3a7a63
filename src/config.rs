//! Runtime settings for Mission Control.
//!
//! Resolved in layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. `.mission-control/config.toml` (or the file passed with `--config`)
//! 3. environment variables, after loading `.env` via dotenvy
//! 4. CLI flags, applied by the command that needs them
//!
//! ```toml
//! database_path = ".mission-control/mission-control.db"
//! port = 8787
//! cors_origins = ["http://localhost:5173"]
//! openclaw_gateway_url = "http://127.0.0.1:18789"
//! openclaw_gateway_token = "..."
//! telegram_chat_id = "-1001234567890"
//! telegram_topic_id = "42"
//! apply_war_room_moves = false
//! war_room_poll_attempts = 25
//! war_room_poll_interval_ms = 1500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::control::gateway::{GatewayError, OpenClawClient, PollPolicy, TelegramTarget};
use crate::errors::ControlError;

/// Directory holding the default database and config file.
pub const CONFIG_DIR: &str = ".mission-control";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub openclaw_gateway_url: Option<String>,
    pub openclaw_gateway_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_topic_id: Option<String>,
    /// When false the war room only proposes status changes.
    pub apply_war_room_moves: bool,
    pub war_room_poll_attempts: u32,
    pub war_room_poll_interval_ms: u64,
    pub war_room_history_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let poll = PollPolicy::default();
        Self {
            database_path: Path::new(CONFIG_DIR).join("mission-control.db"),
            port: 8787,
            cors_origins: vec!["http://localhost:5173".to_string()],
            openclaw_gateway_url: None,
            openclaw_gateway_token: None,
            telegram_chat_id: None,
            telegram_topic_id: None,
            apply_war_room_moves: false,
            war_room_poll_attempts: poll.max_attempts,
            war_room_poll_interval_ms: poll.interval.as_millis() as u64,
            war_room_history_limit: poll.history_limit,
        }
    }
}

impl Settings {
    /// Resolve defaults, config file and environment. An explicit
    /// `config_path` must exist; the default one is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(CONFIG_DIR).join("config.toml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        // A missing .env is normal.
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Failed to load .env");
        }
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Overlay environment variables read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(port) = get("PORT") {
            self.port = parse_number("PORT", &port)?;
        }
        if let Some(origins) = get("CORS_ORIGINS") {
            self.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(url) = get("OPENCLAW_GATEWAY_URL") {
            self.openclaw_gateway_url = Some(url);
        }
        if let Some(token) = get("OPENCLAW_GATEWAY_TOKEN") {
            self.openclaw_gateway_token = Some(token);
        }
        if let Some(chat) = get("TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(chat);
        }
        if let Some(topic) = get("TELEGRAM_TOPIC_ID") {
            self.telegram_topic_id = Some(topic);
        }
        if let Some(apply) = get("APPLY_WAR_ROOM_MOVES") {
            self.apply_war_room_moves = parse_bool("APPLY_WAR_ROOM_MOVES", &apply)?;
        }
        if let Some(attempts) = get("WAR_ROOM_POLL_ATTEMPTS") {
            self.war_room_poll_attempts = parse_number("WAR_ROOM_POLL_ATTEMPTS", &attempts)?;
        }
        if let Some(interval) = get("WAR_ROOM_POLL_INTERVAL_MS") {
            self.war_room_poll_interval_ms = parse_number("WAR_ROOM_POLL_INTERVAL_MS", &interval)?;
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.war_room_poll_attempts,
            interval: Duration::from_millis(self.war_room_poll_interval_ms),
            history_limit: self.war_room_history_limit,
        }
    }

    pub fn telegram_target(&self) -> TelegramTarget {
        TelegramTarget {
            chat_id: self.telegram_chat_id.clone(),
            topic_id: self.telegram_topic_id.clone(),
        }
    }

    /// The process-wide gateway client, if URL and token are both set.
    pub fn gateway_client(&self) -> Result<Option<OpenClawClient>, GatewayError> {
        OpenClawClient::from_parts(
            self.openclaw_gateway_url.as_deref(),
            self.openclaw_gateway_token.as_deref(),
        )
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ControlError::Config(format!("{} must be a boolean, got '{}'", var, value)).into()),
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ControlError::Config(format!("{} must be a number, got '{}'", var, value)).into())
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 8787);
        assert_eq!(s.database_path, PathBuf::from(".mission-control/mission-control.db"));
        assert_eq!(s.cors_origins, vec!["http://localhost:5173"]);
        assert!(!s.apply_war_room_moves);
        assert_eq!(s.poll_policy(), PollPolicy::default());
        assert!(s.gateway_client().unwrap().is_none());
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let s = Settings::parse("port = 9000\napply_war_room_moves = true\n").unwrap();
        assert_eq!(s.port, 9000);
        assert!(s.apply_war_room_moves);
        assert_eq!(s.war_room_poll_attempts, 25);
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        assert!(Settings::parse("port = \"not a port\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut s = Settings::parse("port = 9000\ntelegram_chat_id = \"-1\"").unwrap();
        s.apply_env(env(&[
            ("PORT", "9100"),
            ("TELEGRAM_CHAT_ID", "-100"),
            ("TELEGRAM_TOPIC_ID", "7"),
            ("APPLY_WAR_ROOM_MOVES", "Yes"),
            ("WAR_ROOM_POLL_ATTEMPTS", "3"),
            ("WAR_ROOM_POLL_INTERVAL_MS", "10"),
            ("CORS_ORIGINS", "http://a, http://b,"),
            ("OPENCLAW_GATEWAY_URL", "http://gw"),
            ("OPENCLAW_GATEWAY_TOKEN", "tok"),
        ]))
        .unwrap();

        assert_eq!(s.port, 9100);
        assert!(s.apply_war_room_moves);
        assert_eq!(s.cors_origins, vec!["http://a", "http://b"]);
        assert_eq!(
            s.telegram_target(),
            TelegramTarget {
                chat_id: Some("-100".into()),
                topic_id: Some("7".into()),
            }
        );
        let policy = s.poll_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.interval, Duration::from_millis(10));
        assert!(s.gateway_client().unwrap().is_some());
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut s = Settings::default();
        s.apply_env(env(&[("PORT", ""), ("OPENCLAW_GATEWAY_URL", "  ")])).unwrap();
        assert_eq!(s.port, 8787);
        assert!(s.openclaw_gateway_url.is_none());
    }

    #[test]
    fn test_malformed_env_names_the_variable() {
        let mut s = Settings::default();
        let err = s.apply_env(env(&[("APPLY_WAR_ROOM_MOVES", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("APPLY_WAR_ROOM_MOVES"));

        let err = s.apply_env(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::Config(msg)) if msg.contains("PORT")
        ));
    }

    #[test]
    fn test_parse_bool_variants() {
        for v in ["1", "true", "YES", "On"] {
            assert!(parse_bool("X", v).unwrap());
        }
        for v in ["0", "false", "No", "OFF"] {
            assert!(!parse_bool("X", v).unwrap());
        }
    }

    #[test]
    fn test_load_with_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "war_room_poll_interval_ms = 250\n").unwrap();
        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.war_room_poll_interval_ms, 250);
    }
}
