use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr};
use std::path::Path;

use crate::logging::parse_log_level;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
        }
    }
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

/// Media engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local address WebRTC transports bind to
    pub listen_ip: String,
    /// Address advertised in ICE candidates (for NAT / containers)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// 0 = unlimited
    pub max_rooms: usize,
    /// 0 = unlimited
    pub max_transports_per_client: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            max_rooms: 0,
            max_transports_per_client: 4,
        }
    }
}

impl MediaConfig {
    pub fn listen_ip(&self) -> Result<IpAddr, AddrParseError> {
        self.listen_ip.parse()
    }

    pub fn announced_ip(&self) -> Result<Option<IpAddr>, AddrParseError> {
        self.announced_ip.as_deref().map(str::parse).transpose()
    }
}

/// Signaling server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// 0 = unlimited
    pub max_clients_per_room: usize,
    /// Largest accepted WebSocket message
    pub max_message_bytes: usize,
    /// Per-client outbound queue; messages beyond it are dropped
    pub outbound_queue_size: usize,
    pub keepalive_seconds: u64,
    /// When true anyone may join as a publisher
    pub open_publishing: bool,
    /// User ids allowed to publish when `open_publishing` is off
    pub publishers: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_clients_per_room: 0,
            max_message_bytes: 64 * 1024,
            outbound_queue_size: 1000,
            keepalive_seconds: 30,
            open_publishing: true,
            publishers: Vec::new(),
        }
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

        // CONFAB_SERVER__HTTP_PORT, CONFAB_SIGNALING__PUBLISHERS=alice,bob, ...
        builder = builder.add_source(
            Environment::with_prefix("CONFAB")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signaling.publishers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check every section, collecting all problems instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }

        if parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if self.media.listen_ip().is_err() {
            errors.push(format!("media.listen_ip '{}' is not an IP address", self.media.listen_ip));
        }
        match self.media.announced_ip() {
            Ok(Some(ip)) if ip.is_unspecified() => {
                errors.push("media.announced_ip must not be an unspecified address".to_string());
            }
            Err(_) => errors.push(format!(
                "media.announced_ip '{}' is not an IP address",
                self.media.announced_ip.as_deref().unwrap_or_default()
            )),
            _ => {}
        }
        if self.media.rtc_min_port == 0 {
            errors.push("media.rtc_min_port must be non-zero".to_string());
        }
        if self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) is above media.rtc_max_port ({})",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }

        if self.signaling.outbound_queue_size == 0 {
            errors.push("signaling.outbound_queue_size must be non-zero".to_string());
        }
        if self.signaling.max_message_bytes < 1024 {
            errors.push("signaling.max_message_bytes must be at least 1024".to_string());
        }
        if self.signaling.keepalive_seconds == 0 {
            errors.push("signaling.keepalive_seconds must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.http_port, 3000);
        assert!(config.signaling.open_publishing);
        assert_eq!(config.signaling.outbound_queue_size, 1000);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 8080,
            },
            ..Default::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.media.listen_ip = "not-an-ip".to_string();
        config.media.rtc_min_port = 50000;
        config.media.rtc_max_port = 40000;
        config.logging.format = "xml".to_string();
        config.signaling.outbound_queue_size = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("listen_ip")));
        assert!(errors.iter().any(|e| e.contains("rtc_min_port")));
    }

    #[test]
    fn test_unspecified_announced_ip_rejected() {
        let mut config = Config::default();
        config.media.announced_ip = Some("0.0.0.0".to_string());
        assert!(config.validate().is_err());

        config.media.announced_ip = Some("203.0.113.7".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.media.announced_ip().unwrap(),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  http_port: 9000\nmedia:\n  announced_ip: 198.51.100.1\nsignaling:\n  open_publishing: false\n  publishers:\n    - alice"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.media.announced_ip.as_deref(), Some("198.51.100.1"));
        assert!(!config.signaling.open_publishing);
        assert_eq!(config.signaling.publishers, vec!["alice".to_string()]);
        // Untouched sections keep their defaults
        assert_eq!(config.logging.level, "info");
    }
}
