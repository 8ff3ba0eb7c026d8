use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::webrtc::IceServerConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Direct-transport signaling timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// How often the pending offer is re-written to the mailbox
    pub republish_interval_ms: u64,
    /// How often the mailbox is polled for answers
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for ICE gathering to complete
    pub ice_gathering_timeout_ms: u64,
    /// Maximum directly connected viewers per session (0 = unlimited)
    pub max_direct_viewers: usize,
    /// STUN/TURN URLs handed to new peer connections
    pub ice_servers: Vec<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            republish_interval_ms: 5000,
            poll_interval_ms: 5000,
            ice_gathering_timeout_ms: 10_000,
            max_direct_viewers: 0,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub const fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    #[must_use]
    pub fn ice_server_config(&self) -> IceServerConfig {
        IceServerConfig {
            urls: self.ice_servers.clone(),
        }
    }

    #[must_use]
    pub const fn has_capacity(&self, connected: usize) -> bool {
        self.max_direct_viewers == 0 || connected < self.max_direct_viewers
    }
}

/// Presence and chat limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Chat messages retained per session for late joiners
    pub chat_history_limit: usize,
    pub max_message_length: usize,
    /// Participants without a heartbeat for this long are dropped
    pub participant_timeout_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            chat_history_limit: 50,
            max_message_length: 500,
            participant_timeout_secs: 60,
            reaper_interval_secs: 15,
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub const fn participant_timeout(&self) -> Duration {
        Duration::from_secs(self.participant_timeout_secs)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // EVENTCAST_BROADCAST__POLL_INTERVAL_MS, etc.
        builder = builder.add_source(
            Environment::with_prefix("EVENTCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.broadcast.republish_interval_ms == 0 {
            errors.push("broadcast.republish_interval_ms must be greater than 0".to_string());
        }
        if self.broadcast.poll_interval_ms == 0 {
            errors.push("broadcast.poll_interval_ms must be greater than 0".to_string());
        }
        if self.broadcast.ice_gathering_timeout_ms == 0 {
            errors.push("broadcast.ice_gathering_timeout_ms must be greater than 0".to_string());
        }
        if self.presence.chat_history_limit == 0 {
            errors.push("presence.chat_history_limit must be greater than 0".to_string());
        }
        if self.presence.max_message_length == 0 {
            errors.push("presence.max_message_length must be greater than 0".to_string());
        }
        if self.presence.reaper_interval_secs == 0 {
            errors.push("presence.reaper_interval_secs must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
