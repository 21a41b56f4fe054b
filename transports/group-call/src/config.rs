//! Configuration types for group calls

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default identity reserved for the caller's first link
pub const DEFAULT_PLACEHOLDER_IDENTITY: &str = "__pending_answerer__";

/// Default public STUN server used when credential fetch fails
pub const DEFAULT_FALLBACK_STUN: &str = "stun:stun.l.google.com:19302";

/// Main configuration for a group call client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCallConfig {
    /// Identity (username) of the local participant
    pub local_identity: String,

    /// Reserved identity for the caller's link before the first answer arrives
    pub placeholder_identity: String,

    /// Signaling hub WebSocket URL (ws:// or wss://)
    pub hub_url: String,

    /// Timeout for a single hub RPC round trip in milliseconds (default: 10000)
    pub rpc_timeout_ms: u64,

    /// Maximum simultaneous peer links in the mesh (default: 8, max: 16)
    pub max_peers: u32,

    /// ICE server sourcing
    pub ice: IceConfig,

    /// Local media constraints
    pub media: MediaConstraints,
}

/// ICE server sourcing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// REST endpoint returning `[{urls, username?, credential?}]`
    pub endpoint_url: Option<String>,

    /// Bearer token sent to the credential endpoint
    pub auth_token: Option<String>,

    /// Credential fetch timeout in milliseconds (default: 5000)
    pub fetch_timeout_ms: u64,

    /// STUN entry used when the credential fetch fails
    pub fallback_stun_url: String,

    /// Static STUN server URLs (used when no endpoint is configured)
    pub stun_servers: Vec<String>,

    /// Static TURN server configurations
    pub turn_servers: Vec<TurnServerConfig>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Local media constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Opus clock rate (default: 48000)
    pub audio_sample_rate: u32,

    /// Opus channel count (default: 2)
    pub audio_channels: u16,

    /// Outgoing video codec (default: VP8)
    pub video_codec: VideoCodec,
}

/// Supported video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// VP8 codec (WebRTC standard, wide compatibility)
    VP8,
    /// VP9 codec (better compression, modern browsers)
    VP9,
    /// H.264 codec (universal compatibility)
    H264,
}

impl VideoCodec {
    /// RTP mime type for this codec
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            local_identity: String::new(),
            placeholder_identity: DEFAULT_PLACEHOLDER_IDENTITY.to_string(),
            hub_url: "ws://localhost:8080".to_string(),
            rpc_timeout_ms: 10_000,
            max_peers: 8,
            ice: IceConfig::default(),
            media: MediaConstraints::default(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            auth_token: None,
            fetch_timeout_ms: 5_000,
            fallback_stun_url: DEFAULT_FALLBACK_STUN.to_string(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio_sample_rate: 48_000,
            audio_channels: 2,
            video_codec: VideoCodec::VP8,
        }
    }
}

impl GroupCallConfig {
    /// Create a configuration for the given local identity
    pub fn new(local_identity: &str) -> Self {
        Self {
            local_identity: local_identity.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to parse config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `local_identity` or `placeholder_identity` is empty, or they are equal
    /// - `hub_url` is not a WebSocket URL
    /// - `max_peers` is not in range 1-16
    /// - `rpc_timeout_ms` is zero
    /// - the ICE configuration is invalid
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.local_identity.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "local_identity must not be empty".to_string(),
            ));
        }

        if self.placeholder_identity.is_empty() {
            return Err(Error::InvalidConfig(
                "placeholder_identity must not be empty".to_string(),
            ));
        }

        if self.placeholder_identity == self.local_identity {
            return Err(Error::InvalidConfig(format!(
                "placeholder_identity collides with local_identity ({})",
                self.local_identity
            )));
        }

        if !self.hub_url.starts_with("ws://") && !self.hub_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "hub_url must start with ws:// or wss://, got {}",
                self.hub_url
            )));
        }

        if self.max_peers == 0 || self.max_peers > 16 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-16, got {}",
                self.max_peers
            )));
        }

        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "rpc_timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.ice.validate()
    }

    /// Set the ICE credential endpoint
    pub fn with_ice_endpoint(mut self, url: &str, auth_token: Option<String>) -> Self {
        self.ice.endpoint_url = Some(url.to_string());
        self.ice.auth_token = auth_token;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.ice.turn_servers = turn_servers;
        self
    }

    /// Set the hub URL
    pub fn with_hub_url(mut self, hub_url: &str) -> Self {
        self.hub_url = hub_url.to_string();
        self
    }

    /// Set the maximum number of peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }
}

impl IceConfig {
    fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.fallback_stun_url.starts_with("stun:") {
            return Err(Error::InvalidConfig(format!(
                "fallback_stun_url must start with stun:, got {}",
                self.fallback_stun_url
            )));
        }

        if let Some(url) = &self.endpoint_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::InvalidConfig(format!(
                    "ICE endpoint must start with http:// or https://, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.fetch_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "fetch_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_requires_identity() {
        let config = GroupCallConfig::default();
        assert!(config.validate().is_err());

        let config = GroupCallConfig::new("alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_placeholder_collision_fails() {
        let config = GroupCallConfig::new(DEFAULT_PLACEHOLDER_IDENTITY);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_hub_url_fails() {
        let config = GroupCallConfig::new("alice").with_hub_url("http://localhost:8080");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        assert!(GroupCallConfig::new("alice")
            .with_max_peers(0)
            .validate()
            .is_err());
        assert!(GroupCallConfig::new("alice")
            .with_max_peers(17)
            .validate()
            .is_err());
    }

    #[test]
    fn test_ice_validation() {
        let mut config = GroupCallConfig::new("alice");
        config.ice.fallback_stun_url = "turn:example.com".to_string();
        assert!(config.validate().is_err());

        let config = GroupCallConfig::new("alice").with_ice_endpoint("ftp://creds", None);
        assert!(config.validate().is_err());

        let config = GroupCallConfig::new("alice").with_turn_servers(vec![TurnServerConfig {
            url: "stun:wrong.example.com".to_string(),
            username: "u".to_string(),
            credential: "p".to_string(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GroupCallConfig =
            serde_json::from_str(r#"{"local_identity": "bob", "max_peers": 4}"#).unwrap();
        assert_eq!(config.local_identity, "bob");
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.placeholder_identity, DEFAULT_PLACEHOLDER_IDENTITY);
        assert_eq!(config.media.video_codec, VideoCodec::VP8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_codec_mime_types() {
        assert_eq!(VideoCodec::VP8.mime_type(), "video/VP8");
        assert_eq!(VideoCodec::H264.mime_type(), "video/H264");
    }
}
