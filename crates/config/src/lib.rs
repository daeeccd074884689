//! qdmetrics Configuration Module
//!
//! This module provides the configuration types for the qdmetrics exporter:
//! how to reach the router, which statistics to collect and how often, and
//! how the scrape endpoint behaves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

mod error;
mod loader;
mod stats;

pub use error::{ConfigError, ConfigResult};
pub use loader::{Overrides, ENV_PREFIX};
pub use stats::{default_stat_groups, StatGroup};

/// Default router management port
pub const DEFAULT_ROUTER_PORT: u16 = 5673;
/// Default HTTP port for scrape requests
pub const DEFAULT_SCRAPE_PORT: u16 = 5674;
/// Default topology refresh interval in seconds
pub const DEFAULT_REFRESH_SECS: u64 = 60;
/// Default statistics poll interval in seconds (cache mode only)
pub const DEFAULT_POLL_SECS: u64 = 10;
/// Default link setup timeout
pub const DEFAULT_SETUP_TIMEOUT_MS: u64 = 10_000;
/// Default reply timeout for a single management request
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Default maximum AMQP frame size we advertise
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;
/// Default limit on a reassembled multi-frame message
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;
/// Connection property identifying this client to the router
pub const APP_IDENTIFIER: &str = "Prometheus scrape handler";

/// Router connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Router host name or IP
    pub address: String,
    /// Router AMQP port
    pub port: u16,
    /// SASL username
    #[serde(alias = "ssl-username")]
    pub username: Option<String>,
    /// SASL password
    #[serde(alias = "ssl-password")]
    pub password: Option<String>,
    /// File containing the SASL password
    #[serde(alias = "ssl-password-file")]
    pub password_file: Option<PathBuf>,
    /// Allowed SASL mechanisms, space or comma separated
    #[serde(alias = "sasl-mechanisms")]
    pub sasl_mechanisms: Option<String>,
    /// Client certificate (PEM)
    #[serde(alias = "ssl-certificate")]
    pub ssl_certificate: Option<PathBuf>,
    /// Client private key (PEM)
    #[serde(alias = "ssl-key")]
    pub ssl_key: Option<PathBuf>,
    /// Trusted CA certificates (PEM)
    #[serde(alias = "ssl-trustfile")]
    pub ssl_trustfile: Option<PathBuf>,
    /// Validate the certificate chain but not the host name
    #[serde(alias = "ssl-disable-peer-name-verify")]
    pub ssl_disable_peer_name_verify: bool,
    /// Use TLS even when no certificate files are configured
    pub tls: bool,
    /// Virtual host sent in the open frame and used for SNI
    pub hostname: Option<String>,
    /// Target address of the sender link; anonymous when unset
    pub sender_address: Option<String>,
    /// AMQP container id; generated when unset
    pub container_id: Option<String>,
    /// Connection properties sent in the open frame
    pub properties: BTreeMap<String, String>,
    /// Time allowed for transport, session and both links to come up
    pub setup_timeout_ms: u64,
    /// Time allowed for a single management reply
    pub request_timeout_ms: u64,
    /// Largest frame we accept
    pub max_frame_size: u32,
    /// Idle timeout we advertise (0 disables)
    pub idle_timeout_ms: u32,
    /// Largest message we reassemble from multi-frame transfers
    pub max_message_size: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("app_identifier".to_string(), APP_IDENTIFIER.to_string());
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_ROUTER_PORT,
            username: None,
            password: None,
            password_file: None,
            sasl_mechanisms: None,
            ssl_certificate: None,
            ssl_key: None,
            ssl_trustfile: None,
            ssl_disable_peer_name_verify: false,
            tls: false,
            hostname: None,
            sender_address: None,
            container_id: None,
            properties,
            setup_timeout_ms: DEFAULT_SETUP_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout_ms: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectOptions {
    /// Creates options pointing at the given router
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets the SASL credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the setup timeout
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// `host:port` of the router
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Setup timeout as a duration
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether the transport must be wrapped in TLS
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.ssl_certificate.is_some() || self.ssl_trustfile.is_some()
    }

    /// Parsed SASL mechanism allow-list, upper-cased; empty means "any"
    pub fn allowed_mechanisms(&self) -> Vec<String> {
        self.sasl_mechanisms
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase())
            .collect()
    }

    /// Resolves the SASL password, reading `password_file` when no inline password is set
    pub fn resolve_password(&self) -> ConfigResult<Option<String>> {
        if let Some(password) = &self.password {
            return Ok(Some(password.clone()));
        }
        match &self.password_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Ok(Some(contents.trim_end_matches(['\r', '\n']).to_string()))
            }
            None => Ok(None),
        }
    }

    /// Validates the connection options
    pub fn validate(&self) -> ConfigResult<()> {
        if self.address.is_empty() {
            return Err(ConfigError::invalid("address must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("port must be greater than 0"));
        }
        if self.setup_timeout_ms == 0 {
            return Err(ConfigError::invalid("setup_timeout_ms must be greater than 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms must be greater than 0"));
        }
        if self.max_frame_size < 512 {
            return Err(ConfigError::invalid("max_frame_size must be at least 512"));
        }
        if self.max_message_size < u64::from(self.max_frame_size) {
            return Err(ConfigError::invalid(
                "max_message_size must be at least max_frame_size",
            ));
        }
        if self.ssl_key.is_some() && self.ssl_certificate.is_none() {
            return Err(ConfigError::invalid("ssl_key requires ssl_certificate"));
        }
        if self.ssl_certificate.is_some() && self.ssl_key.is_none() {
            return Err(ConfigError::invalid("ssl_certificate requires ssl_key"));
        }
        Ok(())
    }
}

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, compact, json)
    pub format: String,
    /// Optional log file in addition to stdout
    pub file: Option<PathBuf>,
    /// Enable ANSI colors on stdout
    pub color: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
            color: true,
        }
    }
}

/// Complete exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// HTTP port serving `/metrics`
    pub scrape: u16,
    /// Only query the router we are connected to
    pub local: bool,
    /// Also query edge routers attached to the discovered routers
    pub edge: bool,
    /// Topology refresh interval in seconds
    pub refresh: u64,
    /// Statistics poll interval in seconds (cache mode)
    pub poll: u64,
    /// Serve the last polled statistics instead of querying on each scrape
    pub cache: bool,
    /// Router connection
    #[serde(alias = "connectOptions")]
    pub connect: ConnectOptions,
    /// Statistics to collect
    pub stats: Vec<StatGroup>,
    /// Logging
    pub log: LoggingSettings,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            scrape: DEFAULT_SCRAPE_PORT,
            local: false,
            edge: false,
            refresh: DEFAULT_REFRESH_SECS,
            poll: DEFAULT_POLL_SECS,
            cache: false,
            connect: ConnectOptions::default(),
            stats: default_stat_groups(),
            log: LoggingSettings::default(),
        }
    }
}

impl MetricsConfig {
    /// Topology refresh interval
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh)
    }

    /// Statistics poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll)
    }

    /// Validates the whole configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.refresh == 0 {
            return Err(ConfigError::invalid("refresh must be greater than 0"));
        }
        if self.poll == 0 {
            return Err(ConfigError::invalid("poll must be greater than 0"));
        }
        if self.stats.is_empty() {
            return Err(ConfigError::invalid("at least one stat group is required"));
        }
        for group in &self.stats {
            group.validate()?;
        }
        self.connect.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_default() {
        let options = ConnectOptions::default();
        assert_eq!(options.address, "localhost");
        assert_eq!(options.port, DEFAULT_ROUTER_PORT);
        assert_eq!(options.setup_timeout(), Duration::from_secs(10));
        assert_eq!(
            options.properties.get("app_identifier").map(String::as_str),
            Some(APP_IDENTIFIER)
        );
        assert!(!options.tls_enabled());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_allowed_mechanisms_parsing() {
        let options = ConnectOptions {
            sasl_mechanisms: Some("plain, anonymous EXTERNAL".to_string()),
            ..ConnectOptions::default()
        };
        assert_eq!(
            options.allowed_mechanisms(),
            vec!["PLAIN", "ANONYMOUS", "EXTERNAL"]
        );
        assert!(ConnectOptions::default().allowed_mechanisms().is_empty());
    }

    #[test]
    fn test_tls_enabled_by_trustfile() {
        let options = ConnectOptions {
            ssl_trustfile: Some(PathBuf::from("/etc/ca.pem")),
            ..ConnectOptions::default()
        };
        assert!(options.tls_enabled());
    }

    #[test]
    fn test_message_size_below_frame_size_is_rejected() {
        let options = ConnectOptions {
            max_message_size: 1024,
            ..ConnectOptions::default()
        };
        assert!(options.validate().is_err());
        assert_eq!(ConnectOptions::default().max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_key_without_certificate_is_rejected() {
        let options = ConnectOptions {
            ssl_key: Some(PathBuf::from("key.pem")),
            ..ConnectOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_metrics_config_validation() {
        assert!(MetricsConfig::default().validate().is_ok());

        let config = MetricsConfig {
            refresh: 0,
            ..MetricsConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MetricsConfig {
            stats: Vec::new(),
            ..MetricsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password");
        std::fs::write(&path, "s3cret\n").unwrap();

        let options = ConnectOptions {
            password_file: Some(path),
            ..ConnectOptions::default()
        };
        assert_eq!(options.resolve_password().unwrap().as_deref(), Some("s3cret"));

        let inline = options.clone().with_credentials("admin", "inline");
        assert_eq!(inline.resolve_password().unwrap().as_deref(), Some("inline"));
    }
}
