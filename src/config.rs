//! Booster configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Encoding;

/// Runtime configuration of a booster node.
#[derive(Debug, Clone)]
pub struct BoosterConfig {
    /// Port of the SOCKS5 proxy
    pub proxy_port: u16,
    /// Port of the booster protocol listener
    pub booster_port: u16,
    /// Time allowed between heartbeats before a link is closed
    pub heartbeat_ttl: Duration,
    /// Time allowed for a SOCKS5 command to be set up
    pub request_timeout: Duration,
    /// Connect timeout of direct dials
    pub dial_timeout: Duration,
    /// TCP keep-alive of direct dials
    pub keep_alive: Duration,
    /// Encoding of outgoing packets
    pub encoding: Encoding,
    /// Send SOCKS5 reply frames
    pub socks5_replies: bool,
}

impl BoosterConfig {
    /// Defaults for a node listening on the given ports.
    pub fn new(proxy_port: u16, booster_port: u16) -> Self {
        Self {
            proxy_port,
            booster_port,
            heartbeat_ttl: Duration::from_secs(4),
            request_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            encoding: Encoding::Json,
            socks5_replies: true,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.proxy_port == self.booster_port {
            return Err("proxy_port and booster_port must differ".into());
        }
        if self.heartbeat_ttl < Duration::from_millis(10) {
            return Err("heartbeat_ttl must be at least 10ms".into());
        }
        for (name, d) in [
            ("request_timeout", self.request_timeout),
            ("dial_timeout", self.dial_timeout),
            ("keep_alive", self.keep_alive),
        ] {
            if d.is_zero() {
                return Err(format!("{} cannot be zero", name));
            }
        }
        if self.encoding != Encoding::Json {
            return Err("only the json encoding is implemented".into());
        }
        Ok(())
    }

    /// Interval between outgoing heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_ttl / 2
    }
}

impl Default for BoosterConfig {
    fn default() -> Self {
        Self::new(crate::DEFAULT_PROXY_PORT, crate::DEFAULT_BOOSTER_PORT)
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct BoosterConfigFile {
    pub proxy_port: u16,
    pub booster_port: u16,
    /// Heartbeat TTL (milliseconds)
    pub heartbeat_ttl_ms: u64,
    /// SOCKS5 request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Direct dial timeout (seconds)
    pub dial_timeout_secs: u64,
    /// TCP keep-alive (seconds)
    pub keep_alive_secs: u64,
    /// "json" or "protobuf"
    pub encoding: String,
    pub socks5_replies: bool,
    /// Boosters to wire to at startup (host:port of their booster listener)
    #[serde(default)]
    pub peers: Vec<String>,
}

impl BoosterConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<BoosterConfig, String> {
        let encoding = match self.encoding.as_str() {
            "json" => Encoding::Json,
            "protobuf" => Encoding::Protobuf,
            other => return Err(format!("unknown encoding: {}", other)),
        };

        Ok(BoosterConfig {
            proxy_port: self.proxy_port,
            booster_port: self.booster_port,
            heartbeat_ttl: Duration::from_millis(self.heartbeat_ttl_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            encoding,
            socks5_replies: self.socks5_replies,
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &BoosterConfig) -> Self {
        Self {
            proxy_port: config.proxy_port,
            booster_port: config.booster_port,
            heartbeat_ttl_ms: config.heartbeat_ttl.as_millis() as u64,
            request_timeout_secs: config.request_timeout.as_secs(),
            dial_timeout_secs: config.dial_timeout.as_secs(),
            keep_alive_secs: config.keep_alive.as_secs(),
            encoding: match config.encoding {
                Encoding::Json => "json",
                Encoding::Protobuf => "protobuf",
            }
            .to_string(),
            socks5_replies: config.socks5_replies,
            peers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BoosterConfig::new(1080, 4884);
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(4));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.socks5_replies);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let mut config = BoosterConfig::new(1080, 4884);
        config.heartbeat_ttl = Duration::from_millis(1500);

        let file = BoosterConfigFile::from_config(&config);
        let text = toml::to_string_pretty(&file).unwrap();
        let parsed: BoosterConfigFile = toml::from_str(&text).unwrap();
        let restored = parsed.to_config().unwrap();

        assert_eq!(restored.proxy_port, 1080);
        assert_eq!(restored.heartbeat_ttl, Duration::from_millis(1500));
        assert_eq!(restored.encoding, Encoding::Json);
        assert!(parsed.peers.is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(BoosterConfig::new(1080, 1080).validate().is_err());

        let mut config = BoosterConfig::new(1080, 4884);
        config.encoding = Encoding::Protobuf;
        assert!(config.validate().is_err());

        let mut config = BoosterConfig::new(1080, 4884);
        config.dial_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_encoding() {
        let mut file = BoosterConfigFile::from_config(&BoosterConfig::default());
        file.encoding = "xml".into();
        assert!(file.to_config().is_err());
    }
}
