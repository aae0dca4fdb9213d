//! Configuration system for the HUDDLE CLI.

use huddle_core::{LobbyConfig, SessionConfig, TransferConfig as EngineTransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// HUDDLE configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Lobby membership
    #[serde(default)]
    pub lobby: LobbySection,
    /// Relay server
    #[serde(default)]
    pub relay: RelaySection,
    /// Peer sessions
    #[serde(default)]
    pub session: SessionSection,
    /// Transfers
    #[serde(default)]
    pub transfer: TransferSection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Lobby membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySection {
    /// Signaling server address
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Lobby to join
    #[serde(default = "default_lobby_name")]
    pub lobby_name: String,
    /// Lobby password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Member id; generated per run when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// Display name
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Address on the virtual network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,
}

/// Relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Oldest client version admitted
    #[serde(default = "default_min_version")]
    pub min_version: String,
    /// Upgrade location sent to clients that are too old
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Peer sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Seconds allowed for a session to connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Reconnect attempts before giving up on a peer
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

/// Transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Maximum concurrent downloads
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Frame payload size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Frames sent concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds a download waits for an interrupted owner to come back
    #[serde(default = "default_resume_timeout_secs")]
    pub resume_timeout_secs: u64,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server_url() -> String {
    "ws://127.0.0.1:8787".to_string()
}

fn default_lobby_name() -> String {
    "default".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_min_version() -> String {
    "0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_max_concurrent() -> usize {
    10
}

fn default_chunk_size() -> usize {
    huddle_files::FRAME_CHUNK_SIZE
}

fn default_batch_size() -> usize {
    5
}

fn default_resume_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LobbySection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            lobby_name: default_lobby_name(),
            password: None,
            player_id: None,
            player_name: default_player_name(),
            virtual_ip: None,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            min_version: default_min_version(),
            download_url: None,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            chunk_size: default_chunk_size(),
            batch_size: default_batch_size(),
            resume_timeout_secs: default_resume_timeout_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("huddle/config.toml")
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse the relay bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.bind_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.lobby.server_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "Server URL must use ws:// or wss://, got {}",
                self.lobby.server_url
            );
        }

        if self.lobby.lobby_name.trim().is_empty() {
            anyhow::bail!("Lobby name must not be empty");
        }

        self.parse_bind_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        if self.transfer.max_concurrent == 0 || self.transfer.max_concurrent > 1000 {
            anyhow::bail!("Max concurrent transfers must be between 1 and 1000");
        }

        if self.transfer.batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }

        if self.transfer.resume_timeout_secs == 0 {
            anyhow::bail!("Resume timeout must be at least 1 second");
        }

        if self.session.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least 1 second");
        }

        Ok(())
    }

    /// Build the library configuration for joining a lobby
    #[must_use]
    pub fn to_lobby_config(&self) -> LobbyConfig {
        let mut config = LobbyConfig {
            server_url: self.lobby.server_url.clone(),
            player_name: self.lobby.player_name.clone(),
            lobby_name: self.lobby.lobby_name.clone(),
            lobby_password: self.lobby.password.clone(),
            virtual_ip: self.lobby.virtual_ip.clone(),
            session: SessionConfig {
                connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
                heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
                heartbeat_timeout: Duration::from_secs(self.session.heartbeat_interval_secs * 3),
                max_reconnect_attempts: self.session.max_reconnect_attempts,
                ..SessionConfig::default()
            },
            transfer: EngineTransferConfig {
                max_concurrent_transfers: self.transfer.max_concurrent,
                frame_chunk_size: self.transfer.chunk_size,
                send_batch_size: self.transfer.batch_size,
                resume_timeout: Duration::from_secs(self.transfer.resume_timeout_secs),
                ..EngineTransferConfig::default()
            },
            ..LobbyConfig::default()
        };
        if let Some(id) = &self.lobby.player_id {
            config.player_id = id.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.lobby.server_url, "ws://127.0.0.1:8787");
        assert_eq!(config.relay.bind_addr, "0.0.0.0:8787");
        assert_eq!(config.transfer.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.transfer.max_concurrent, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.lobby.server_url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        config.lobby.server_url = "wss://lobby.example.com".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        config.transfer.chunk_size = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [lobby]
            lobby_name = "friday"
            player_id = "player-7"
            "#,
        )
        .unwrap();
        assert_eq!(config.lobby.lobby_name, "friday");
        assert_eq!(config.lobby.player_name, "Player");
        assert_eq!(config.session.max_reconnect_attempts, 10);

        let lobby = config.to_lobby_config();
        assert_eq!(lobby.player_id, "player-7");
        assert_eq!(lobby.session.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(lobby.transfer.resume_timeout, Duration::from_secs(60));
        assert!(lobby.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.lobby.password = Some("hunter2".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.lobby.password.as_deref(), Some("hunter2"));
        assert_eq!(loaded.transfer.batch_size, 5);
    }
}
