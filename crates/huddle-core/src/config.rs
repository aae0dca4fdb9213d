//! Lobby configuration

use crate::error::{Error, Result};
use huddle_files::{FRAME_CHUNK_SIZE, MIB};
use huddle_signaling::SignalingConfig;
use std::time::Duration;

/// Lobby member configuration
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Signaling server address (`ws://host:port`)
    pub server_url: String,

    /// Local member id
    pub player_id: String,

    /// Local display name
    pub player_name: String,

    /// Lobby to join
    pub lobby_name: String,

    /// Lobby password
    pub lobby_password: Option<String>,

    /// Address on the virtual network, announced to other members
    pub virtual_ip: Option<String>,

    /// Signaling client configuration
    pub signaling: SignalingConfig,

    /// Peer session configuration
    pub session: SessionConfig,

    /// Data channel configuration
    pub channel: ChannelConfig,

    /// Transfer engine configuration
    pub transfer: TransferConfig,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8787".to_string(),
            player_id: format!("player-{}", uuid::Uuid::new_v4()),
            player_name: "Player".to_string(),
            lobby_name: "default".to_string(),
            lobby_password: None,
            virtual_ip: None,
            signaling: SignalingConfig::default(),
            session: SessionConfig::default(),
            channel: ChannelConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl LobbyConfig {
    /// Validate every sub-configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.player_id.is_empty() {
            return Err(Error::invalid_config("player_id must not be empty"));
        }
        if self.lobby_name.is_empty() {
            return Err(Error::invalid_config("lobby_name must not be empty"));
        }
        self.session.validate()?;
        self.channel.validate()?;
        self.transfer.validate()
    }
}

/// Peer session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for a new session to reach the connected state
    pub connect_timeout: Duration,

    /// Longest an incoming offer waits for an in-flight negotiation
    pub negotiation_wait: Duration,

    /// Delay before the glare winner reconnects a failed session
    pub failed_reconnect_delay: Duration,

    /// Lower bound of the self-healing grace period after a disconnect
    pub disconnect_grace_min: Duration,

    /// Upper bound of the self-healing grace period after a disconnect
    pub disconnect_grace_max: Duration,

    /// Reconnect attempts before a session is left failed
    pub max_reconnect_attempts: u32,

    /// Interval between control channel heartbeats
    pub heartbeat_interval: Duration,

    /// Silence after which a peer is reported stale
    pub heartbeat_timeout: Duration,

    /// Capacity of the lobby event broadcast
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            negotiation_wait: Duration::from_secs(3),
            failed_reconnect_delay: Duration::from_secs(2),
            disconnect_grace_min: Duration::from_secs(5),
            disconnect_grace_max: Duration::from_secs(8),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            event_capacity: 1024,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be non-zero"));
        }
        if self.disconnect_grace_min > self.disconnect_grace_max {
            return Err(Error::invalid_config(
                "disconnect_grace_min exceeds disconnect_grace_max",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::invalid_config("heartbeat_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Data channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Buffered bytes above which sends wait
    pub high_water_mark: usize,

    /// Poll interval while waiting for the buffer to drain
    pub drain_poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_water_mark: (16 * MIB) as usize,
            drain_poll_interval: Duration::from_millis(10),
        }
    }
}

impl ChannelConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.drain_poll_interval.is_zero() {
            return Err(Error::invalid_config("drain_poll_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Transfer engine configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Whole-file transfers allowed to run at once
    pub max_concurrent_transfers: usize,

    /// Frames sent concurrently per batch
    pub send_batch_size: usize,

    /// Payload bytes per chunk frame
    pub frame_chunk_size: usize,

    /// Capacity of the progress broadcast
    pub progress_capacity: usize,

    /// Finished transfers whose final progress stays queryable
    pub progress_retention: usize,

    /// How long downloads wait for an interrupted owner session to recover
    pub resume_timeout: Duration,

    /// How often expired shares are withdrawn
    pub share_sweep_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 10,
            send_batch_size: 5,
            frame_chunk_size: FRAME_CHUNK_SIZE,
            progress_capacity: 1024,
            progress_retention: 256,
            resume_timeout: Duration::from_secs(60),
            share_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl TransferConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers == 0 {
            return Err(Error::invalid_config("max_concurrent_transfers must be at least 1"));
        }
        if self.send_batch_size == 0 {
            return Err(Error::invalid_config("send_batch_size must be at least 1"));
        }
        if self.frame_chunk_size == 0 {
            return Err(Error::invalid_config("frame_chunk_size must be at least 1"));
        }
        if self.resume_timeout.is_zero() {
            return Err(Error::invalid_config("resume_timeout must be non-zero"));
        }
        if self.share_sweep_interval.is_zero() {
            return Err(Error::invalid_config("share_sweep_interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LobbyConfig::default();
        assert!(config.player_id.starts_with("player-"));
        assert_eq!(config.session.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.session.negotiation_wait, Duration::from_secs(3));
        assert_eq!(config.channel.high_water_mark, 16 * 1024 * 1024);
        assert_eq!(config.transfer.max_concurrent_transfers, 10);
        assert_eq!(config.transfer.send_batch_size, 5);
        assert_eq!(config.transfer.frame_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.transfer.resume_timeout, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let mut config = LobbyConfig::default();
        config.transfer.max_concurrent_transfers = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = LobbyConfig::default();
        config.transfer.share_sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = LobbyConfig::default();
        config.session.disconnect_grace_min = Duration::from_secs(9);
        assert!(config.validate().is_err());

        let config = LobbyConfig {
            lobby_name: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
