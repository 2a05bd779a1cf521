//! Configuration management for pairsignal

use crate::webrtc::SideTags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Video codec offered on the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[default]
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::VP8 => 97,
            VideoCodec::VP9 => 98,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay client configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Retry cadence configuration
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Side tags used on the bus
    #[serde(default)]
    pub tags: SideTags,

    /// Peer connection configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Delay before the first reconnect attempt
    #[serde(default)]
    pub first_reconnect_delay_ms: u64,

    /// Delay between subsequent reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            first_reconnect_delay_ms: 0,
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Interval between rebroadcasts of unacknowledged messages
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Upper bound on broadcasts per local candidate (unbounded if unset)
    #[serde(default)]
    pub candidate_max_broadcasts: Option<u32>,
}

impl NegotiationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            candidate_max_broadcasts: None,
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Video codec selection
    #[serde(default)]
    pub video_codec: VideoCodec,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            video_codec: VideoCodec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// WebSocket route
    #[serde(default = "default_relay_path")]
    pub path: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            path: default_relay_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            negotiation: NegotiationConfig::default(),
            tags: SideTags::default(),
            webrtc: WebRTCConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read
    Io(std::io::Error),
    /// The file is not valid TOML for this schema
    Parse(toml::de::Error),
    /// A value is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.signaling.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::Invalid("signaling endpoint must not be empty".into()));
        }
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ConfigError::Invalid(
                "signaling endpoint must be a ws:// or wss:// URL".into(),
            ));
        }

        if self.signaling.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnect delay must be non-zero".into()));
        }

        if self.negotiation.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("retry interval must be non-zero".into()));
        }

        if self.negotiation.candidate_max_broadcasts == Some(0) {
            return Err(ConfigError::Invalid(
                "candidate_max_broadcasts must be at least 1 when set".into(),
            ));
        }

        let tags = self.tags.all();
        if tags.iter().any(|tag| tag.is_empty()) {
            return Err(ConfigError::Invalid("side tags must not be empty".into()));
        }
        let unique: HashSet<&str> = tags.iter().copied().collect();
        if unique.len() != tags.len() {
            return Err(ConfigError::Invalid("side tags must be distinct".into()));
        }

        if self.webrtc.ice_servers.is_empty()
            || self.webrtc.ice_servers.iter().any(|s| s.urls.is_empty())
        {
            return Err(ConfigError::Invalid("at least one ICE server URL is required".into()));
        }

        if !self.relay.path.starts_with('/') {
            return Err(ConfigError::Invalid("relay path must start with '/'".into()));
        }

        Ok(())
    }
}


fn default_endpoint() -> String {
    "ws://127.0.0.1:7280/chat".to_string()
}

fn default_reconnect_delay_ms() -> u64 { 5000 }
fn default_retry_interval_ms() -> u64 { 8000 }
fn default_relay_port() -> u16 { 7280 }

fn default_relay_host() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_path() -> String {
    "/chat".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}
