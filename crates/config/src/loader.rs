//! Layered configuration loading.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `METRICS_*`
//! environment variables, command line overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::{ConfigError, ConfigResult, MetricsConfig};

/// Prefix of environment variables that override configuration keys
pub const ENV_PREFIX: &str = "METRICS_";

/// File looked up in the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "qdmetrics.toml";

/// Values supplied on the command line. `None` leaves the lower layer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub scrape: Option<u16>,
    pub local: Option<bool>,
    pub edge: Option<bool>,
    pub refresh: Option<u64>,
    pub poll: Option<u64>,
    pub cache: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub sasl_mechanisms: Option<String>,
    pub ssl_certificate: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_trustfile: Option<PathBuf>,
    pub ssl_disable_peer_name_verify: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl MetricsConfig {
    /// Parses a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Loads the configuration file.
    ///
    /// An explicit `path` must exist. Without one, `qdmetrics.toml` in the
    /// working directory is used when present and defaults otherwise.
    pub fn from_file(path: Option<&Path>) -> ConfigResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !explicit && !path.exists() {
            debug!("no config file found, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Full load: file, then process environment, then `overrides`, then validation
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> ConfigResult<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(std::env::vars())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Applies `METRICS_<KEY>` variables from `vars`. Unknown keys are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_uppercase().replace('-', "_");
            if !self.apply_key(&key, value.as_ref())? {
                warn!(variable = name.as_ref(), "ignoring unknown environment override");
            }
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) -> ConfigResult<bool> {
        let connect = &mut self.connect;
        match key {
            "SCRAPE" => self.scrape = parse(key, value)?,
            "LOCAL" => self.local = parse_bool(key, value)?,
            "EDGE" => self.edge = parse_bool(key, value)?,
            "REFRESH" => self.refresh = parse(key, value)?,
            "POLL" => self.poll = parse(key, value)?,
            "CACHE" => self.cache = parse_bool(key, value)?,
            "ADDRESS" => connect.address = value.to_string(),
            "PORT" => connect.port = parse(key, value)?,
            "USERNAME" | "SSL_USERNAME" => connect.username = Some(value.to_string()),
            "PASSWORD" | "SSL_PASSWORD" => connect.password = Some(value.to_string()),
            "PASSWORD_FILE" | "SSL_PASSWORD_FILE" => connect.password_file = Some(value.into()),
            "SASL_MECHANISMS" => connect.sasl_mechanisms = Some(value.to_string()),
            "SSL_CERTIFICATE" => connect.ssl_certificate = Some(value.into()),
            "SSL_KEY" => connect.ssl_key = Some(value.into()),
            "SSL_TRUSTFILE" => connect.ssl_trustfile = Some(value.into()),
            "SSL_DISABLE_PEER_NAME_VERIFY" => {
                connect.ssl_disable_peer_name_verify = parse_bool(key, value)?
            }
            "LOG_LEVEL" => self.log.level = value.to_string(),
            "LOG_FORMAT" => self.log.format = value.to_string(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Applies command line values on top of everything else
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        let o = overrides.clone();
        let connect = &mut self.connect;

        if let Some(v) = o.scrape {
            self.scrape = v;
        }
        if let Some(v) = o.local {
            self.local = v;
        }
        if let Some(v) = o.edge {
            self.edge = v;
        }
        if let Some(v) = o.refresh {
            self.refresh = v;
        }
        if let Some(v) = o.poll {
            self.poll = v;
        }
        if let Some(v) = o.cache {
            self.cache = v;
        }
        if let Some(v) = o.address {
            connect.address = v;
        }
        if let Some(v) = o.port {
            connect.port = v;
        }
        if o.username.is_some() {
            connect.username = o.username;
        }
        if o.password.is_some() {
            connect.password = o.password;
        }
        if o.password_file.is_some() {
            connect.password_file = o.password_file;
        }
        if o.sasl_mechanisms.is_some() {
            connect.sasl_mechanisms = o.sasl_mechanisms;
        }
        if o.ssl_certificate.is_some() {
            connect.ssl_certificate = o.ssl_certificate;
        }
        if o.ssl_key.is_some() {
            connect.ssl_key = o.ssl_key;
        }
        if o.ssl_trustfile.is_some() {
            connect.ssl_trustfile = o.ssl_trustfile;
        }
        if let Some(v) = o.ssl_disable_peer_name_verify {
            connect.ssl_disable_peer_name_verify = v;
        }
        if let Some(v) = o.log_level {
            self.log.level = v;
        }
        if let Some(v) = o.log_format {
            self.log.format = v;
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_value(key, value))
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid_value(key, value)),
    }
}
