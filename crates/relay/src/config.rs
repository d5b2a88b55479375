//! Configuration system for syncroom
//!
//! Reads config from ~/.config/syncroom/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub http_port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 1234,
            http_port: 8080,
            bind: "127.0.0.1".to_string(),
        }
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshot database path; defaults to ~/.config/syncroom/snapshots.db
    pub db_path: Option<PathBuf>,
    /// Burst-coalescing window for snapshot writes, in milliseconds
    pub save_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            save_debounce_ms: 500,
        }
    }
}

/// Session and presence liveness configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Ping cadence; a session missing a full ping/pong round trip is dropped
    pub ping_interval_secs: u64,
    /// Presence entries older than this are swept from peers' views
    pub presence_window_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            presence_window_secs: 30,
        }
    }
}

/// Full application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    pub liveness: LivenessConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    pub fn load() -> Self {
        let config_path = Self::default_config_path();
        Self::load_from_path(&config_path).unwrap_or_default()
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("syncroom")
            .join("config.toml")
    }

    /// Load from a specific path
    pub fn load_from_path(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unparseable config");
                None
            }
        }
    }

    /// Create default config file if it doesn't exist
    pub fn create_default_if_missing() {
        let path = Self::default_config_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let default_config = r#"# syncroom Configuration

[server]
ws_port = 1234
http_port = 8080
bind = "127.0.0.1"

[persistence]
# db_path = "/var/lib/syncroom/snapshots.db"
save_debounce_ms = 500

[liveness]
ping_interval_secs = 30
presence_window_secs = 30
"#;
            let _ = std::fs::write(&path, default_config);
        }
    }

    /// Resolved snapshot database path
    pub fn db_path(&self) -> PathBuf {
        self.persistence.db_path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("syncroom")
                .join("snapshots.db")
        })
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence.save_debounce_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.liveness.ping_interval_secs)
    }

    pub fn presence_window(&self) -> Duration {
        Duration::from_secs(self.liveness.presence_window_secs)
    }
}
