use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use qdmetrics_config::{MetricsConfig, Overrides};

/// Command line of the `qdmetrics` binary. Every option falls back to the
/// configuration file and `METRICS_*` environment variables.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "qdmetrics",
    version = env!("CARGO_PKG_VERSION"),
    about = "Prometheus exporter for Qpid Dispatch router networks"
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Router host to connect to
    #[arg(short = 'a', long, value_name = "HOST")]
    pub address: Option<String>,

    /// Router AMQP port
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// HTTP port serving /metrics
    #[arg(long, value_name = "PORT")]
    pub scrape: Option<u16>,

    /// Only query the connected router
    #[arg(long)]
    pub local: bool,

    /// Also query edge routers
    #[arg(long)]
    pub edge: bool,

    /// Serve statistics from the last poll
    #[arg(long)]
    pub cache: bool,

    /// Topology refresh interval
    #[arg(long, value_name = "SECONDS")]
    pub refresh: Option<u64>,

    /// Statistics poll interval when caching
    #[arg(long, value_name = "SECONDS")]
    pub poll: Option<u64>,

    #[arg(long, value_name = "USER")]
    pub username: Option<String>,

    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Read the password from a file
    #[arg(long, value_name = "PATH")]
    pub password_file: Option<PathBuf>,

    /// Space separated SASL mechanisms to allow
    #[arg(long, value_name = "MECHS")]
    pub sasl_mechanisms: Option<String>,

    /// Client certificate (PEM)
    #[arg(long, value_name = "PATH")]
    pub ssl_certificate: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, value_name = "PATH")]
    pub ssl_key: Option<PathBuf>,

    /// Trusted CA certificates (PEM)
    #[arg(long, value_name = "PATH")]
    pub ssl_trustfile: Option<PathBuf>,

    #[arg(long)]
    pub ssl_disable_peer_name_verify: bool,

    /// Log level or filter directive
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log format (text, compact, json)
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Values given on the command line; absent flags stay `None`.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            address: self.address.clone(),
            port: self.port,
            scrape: self.scrape,
            local: self.local.then_some(true),
            edge: self.edge.then_some(true),
            refresh: self.refresh,
            poll: self.poll,
            cache: self.cache.then_some(true),
            username: self.username.clone(),
            password: self.password.clone(),
            password_file: self.password_file.clone(),
            sasl_mechanisms: self.sasl_mechanisms.clone(),
            ssl_certificate: self.ssl_certificate.clone(),
            ssl_key: self.ssl_key.clone(),
            ssl_trustfile: self.ssl_trustfile.clone(),
            ssl_disable_peer_name_verify: self.ssl_disable_peer_name_verify.then_some(true),
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
        }
    }

    /// Loads the layered configuration this command line describes.
    pub fn load(&self) -> Result<MetricsConfig> {
        let path = self.config.as_deref();
        MetricsConfig::load(path, &self.overrides()).with_context(|| match path {
            Some(p) => format!("failed to load configuration from {}", p.display()),
            None => "failed to load configuration".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_no_flags_override_nothing() {
        let cli = Cli::try_parse_from(["qdmetrics"]).unwrap();
        assert_eq!(cli.overrides(), Overrides::default());
    }

    #[test]
    fn test_flags_map_to_overrides() {
        let cli = Cli::try_parse_from([
            "qdmetrics",
            "-a",
            "router.example",
            "-p",
            "5672",
            "--scrape",
            "9100",
            "--edge",
            "--cache",
            "--poll",
            "5",
            "--log-format",
            "json",
        ])
        .unwrap();
        let overrides = cli.overrides();

        assert_eq!(overrides.address.as_deref(), Some("router.example"));
        assert_eq!(overrides.port, Some(5672));
        assert_eq!(overrides.scrape, Some(9100));
        assert_eq!(overrides.edge, Some(true));
        assert_eq!(overrides.cache, Some(true));
        assert_eq!(overrides.local, None);
        assert_eq!(overrides.poll, Some(5));
        assert_eq!(overrides.log_format.as_deref(), Some("json"));
    }

    #[test]
    fn test_load_applies_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scrape = 9000\nrefresh = 30\n\n[connect]\naddress = \"file-host\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from(["qdmetrics", "--config", &path, "--scrape", "9100"]).unwrap();
        let config = cli.load().unwrap();

        assert_eq!(config.scrape, 9100);
        assert_eq!(config.refresh, 30);
        assert_eq!(config.connect.address, "file-host");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let cli = Cli::try_parse_from(["qdmetrics", "--config", "/nonexistent/qdmetrics.toml"]).unwrap();
        let err = cli.load().unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/qdmetrics.toml"));
    }
}
