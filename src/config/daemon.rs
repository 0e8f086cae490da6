//! Daemon configuration.
//!
//! Loaded from `config.json` in the XDG config directory, then overridden by
//! `AGENTBUS_*` environment variables, then by command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::XdgDirs;
use crate::events::EventType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

fn default_namespace() -> String {
    "agentbus".to_string()
}

fn default_relay_types() -> Vec<EventType> {
    vec![EventType::Message, EventType::Status, EventType::Lifecycle]
}

/// Relay bridge settings. The relay runs only when enabled and a URL is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker address, `host:port` or `tcp://host:port`.
    pub url: Option<String>,
    /// Topic namespace shared by cooperating devices.
    #[serde(alias = "id")]
    pub namespace: String,
    pub enabled: bool,
    /// Event types mirrored to other devices.
    pub event_types: Vec<EventType>,
    pub batch_size: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    /// Periodic push even without local activity.
    pub push_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_namespace(),
            enabled: true,
            event_types: default_relay_types(),
            batch_size: 100,
            backoff_base_ms: 1000,
            backoff_cap_secs: 60,
            push_interval_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && self.url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub db_path: PathBuf,
    /// Two edits of one file by different sessions closer than this collide.
    pub collision_window_secs: u64,
    /// Silent connections mark their session idle after this long.
    pub idle_after_secs: u64,
    /// Sessions unseen for this long are archived.
    pub archive_after_secs: u64,
    pub sweep_interval_secs: u64,
    /// Events buffered per subscriber before a gap is reported.
    pub subscriber_buffer: usize,
    pub relay: RelayConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::with_dirs(&XdgDirs::new())
    }
}

impl DaemonConfig {
    pub fn with_dirs(dirs: &XdgDirs) -> Self {
        Self {
            socket_path: dirs.socket(),
            db_path: dirs.database(),
            collision_window_secs: 20,
            idle_after_secs: 300,
            archive_after_secs: 24 * 60 * 60,
            sweep_interval_secs: 30,
            subscriber_buffer: crate::subscriptions::DEFAULT_SUBSCRIBER_BUFFER,
            relay: RelayConfig::default(),
        }
    }

    pub fn default_config_path() -> PathBuf {
        XdgDirs::new().config_file()
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` (or the default path), falling back to defaults when
    /// the file does not exist. A file that exists but cannot be parsed is an
    /// error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        tracing::debug!(path = %path.display(), "Loading config");
        Self::load_from_path(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `AGENTBUS_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("AGENTBUS_SOCKET") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBUS_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBUS_COLLISION_WINDOW_SECS") {
            self.collision_window_secs = parse_number("AGENTBUS_COLLISION_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("AGENTBUS_IDLE_AFTER_SECS") {
            self.idle_after_secs = parse_number("AGENTBUS_IDLE_AFTER_SECS", &v)?;
        }
        if let Some(v) = lookup("AGENTBUS_RELAY_URL") {
            self.relay.url = (!v.trim().is_empty()).then(|| v.trim().to_string());
        }
        if let Some(v) = lookup("AGENTBUS_RELAY_ID") {
            self.relay.namespace = v;
        }
        if let Some(v) = lookup("AGENTBUS_RELAY_ENABLED") {
            self.relay.enabled = match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::invalid(
                        "AGENTBUS_RELAY_ENABLED",
                        format!("expected a boolean, got '{}'", other),
                    ))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("collision_window_secs", self.collision_window_secs),
            ("idle_after_secs", self.idle_after_secs),
            ("archive_after_secs", self.archive_after_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("subscriber_buffer", self.subscriber_buffer as u64),
            ("relay.batch_size", self.relay.batch_size as u64),
            ("relay.backoff_base_ms", self.relay.backoff_base_ms),
            ("relay.push_interval_secs", self.relay.push_interval_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if Duration::from_secs(self.relay.backoff_cap_secs) < self.backoff_base() {
            return Err(ConfigError::invalid(
                "relay.backoff_cap_secs",
                "must not be shorter than relay.backoff_base_ms",
            ));
        }

        let ns = &self.relay.namespace;
        if ns.is_empty() || ns.contains(&['/', '+', '#'][..]) {
            return Err(ConfigError::invalid(
                "relay.namespace",
                format!("'{}' must be non-empty and contain no '/', '+' or '#'", ns),
            ));
        }
        if let Some(url) = &self.relay.url {
            crate::relay::parse_relay_url(url)
                .map_err(|e| ConfigError::invalid("relay.url", e.to_string()))?;
        }
        Ok(())
    }

    pub fn collision_window(&self) -> Duration {
        Duration::from_secs(self.collision_window_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn archive_after(&self) -> Duration {
        Duration::from_secs(self.archive_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.relay.backoff_base_ms)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("expected a number, got '{}'", value)))
}

#[cfg(test)]
mod tests {
    //! Coverage:
    //! - defaults and validation
    //! - JSON loading with partial files and the `id` alias
    //! - environment overrides and their errors

    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.collision_window(), Duration::from_secs(20));
        assert_eq!(config.idle_after(), Duration::from_secs(300));
        assert!(!config.relay.is_active());
        assert_eq!(config.relay.batch_size, 100);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"collision_window_secs": 5, "relay": {"url": "tcp://broker:7883", "id": "team"}}"#,
        )
        .unwrap();

        let config = DaemonConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.collision_window_secs, 5);
        assert_eq!(config.idle_after_secs, 300);
        assert_eq!(config.relay.namespace, "team");
        assert!(config.relay.is_active());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = DaemonConfig::load_or_default(Some(&tmp.path().join("nope.json"))).unwrap();
        assert_eq!(config.collision_window_secs, 20);
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            DaemonConfig::load_or_default(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let mut config = DaemonConfig::default();
        config.relay.url = Some("localhost:7883".into());
        config.save_to_path(&path).unwrap();
        assert_eq!(DaemonConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DaemonConfig::default();
        config
            .apply_env_from(env(&[
                ("AGENTBUS_SOCKET", "/tmp/bus.sock"),
                ("AGENTBUS_DB", "/tmp/bus.db"),
                ("AGENTBUS_COLLISION_WINDOW_SECS", "45"),
                ("AGENTBUS_IDLE_AFTER_SECS", "60"),
                ("AGENTBUS_RELAY_URL", "broker:1883"),
                ("AGENTBUS_RELAY_ID", "lab"),
                ("AGENTBUS_RELAY_ENABLED", "off"),
            ]))
            .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/bus.sock"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/bus.db"));
        assert_eq!(config.collision_window_secs, 45);
        assert_eq!(config.idle_after_secs, 60);
        assert_eq!(config.relay.url.as_deref(), Some("broker:1883"));
        assert_eq!(config.relay.namespace, "lab");
        assert!(!config.relay.is_active());
    }

    #[test]
    fn test_env_errors() {
        let mut config = DaemonConfig::default();
        assert!(config
            .apply_env_from(env(&[("AGENTBUS_IDLE_AFTER_SECS", "soon")]))
            .is_err());
        assert!(config
            .apply_env_from(env(&[("AGENTBUS_RELAY_ENABLED", "maybe")]))
            .is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.collision_window_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { key, .. }) if key == "collision_window_secs"));

        let mut config = DaemonConfig::default();
        config.relay.url = Some("not a url".into());
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.relay.namespace = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.relay.backoff_base_ms = 120_000;
        assert!(config.validate().is_err());
    }
}
