//! Configuration loading tests
//!
//! Covers TOML parsing, environment overrides and command line precedence.

use qdmetrics_config::*;
use std::path::PathBuf;
use tempfile::TempDir;

#[cfg(test)]
mod config_tests {
    use super::*;

    const SAMPLE: &str = r#"
scrape = 9090
edge = true
refresh = 30
cache = true

[connect]
address = "router.example"
port = 5672
username = "admin"
sasl_mechanisms = "PLAIN"

[[stats]]
entity = "router"
attributes = ["deliveriesIngress", "deliveriesEgress"]

[[stats]]
entity = "router.link"
alias = "link"
attributes = ["deliveryCount"]

[log]
level = "debug"
format = "json"
"#;

    /// Test that a full TOML file maps onto the config structure
    #[test]
    fn test_toml_parsing() {
        let config = MetricsConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.scrape, 9090);
        assert!(config.edge);
        assert!(!config.local);
        assert_eq!(config.refresh, 30);
        assert_eq!(config.poll, DEFAULT_POLL_SECS);
        assert!(config.cache);
        assert_eq!(config.connect.address, "router.example");
        assert_eq!(config.connect.port, 5672);
        assert_eq!(config.connect.username.as_deref(), Some("admin"));
        assert_eq!(config.connect.setup_timeout_ms, DEFAULT_SETUP_TIMEOUT_MS);
        assert_eq!(config.stats.len(), 2);
        assert_eq!(config.stats[1].alias.as_deref(), Some("link"));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        assert!(config.validate().is_ok());
    }

    /// Test that omitted sections fall back to defaults
    #[test]
    fn test_empty_file_uses_defaults() {
        let config = MetricsConfig::from_toml_str("").unwrap();
        assert_eq!(config, MetricsConfig::default());
        assert_eq!(config.stats, default_stat_groups());
    }

    /// Test loading from an explicit path
    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qdmetrics.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = MetricsConfig::from_file(Some(&path)).unwrap();
        assert_eq!(config.scrape, 9090);
    }

    /// Test that an explicitly requested file must exist
    #[test]
    fn test_missing_explicit_file_is_error() {
        let path = PathBuf::from("/nonexistent/qdmetrics.toml");
        let err = MetricsConfig::from_file(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    /// Test that malformed TOML reports the file
    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "scrape = \"not a number\"").unwrap();

        let err = MetricsConfig::from_file(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    /// Test environment overrides, including dashed and lower-case names
    #[test]
    fn test_env_overrides() {
        let mut config = MetricsConfig::from_toml_str(SAMPLE).unwrap();
        config
            .apply_env(vec![
                ("METRICS_PORT", "6000"),
                ("METRICS_ssl-trustfile", "/etc/ca.pem"),
                ("METRICS_LOCAL", "yes"),
                ("METRICS_CACHE", "false"),
                ("UNRELATED", "ignored"),
                ("METRICS_UNKNOWN_KEY", "ignored"),
            ])
            .unwrap();

        assert_eq!(config.connect.port, 6000);
        assert_eq!(
            config.connect.ssl_trustfile,
            Some(PathBuf::from("/etc/ca.pem"))
        );
        assert!(config.local);
        assert!(!config.cache);
        assert!(config.connect.tls_enabled());
    }

    /// Test that bad environment values are reported with their key
    #[test]
    fn test_env_invalid_value() {
        let mut config = MetricsConfig::default();
        let err = config
            .apply_env(vec![("METRICS_REFRESH", "soon")])
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "REFRESH");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Test that command line values win over environment values
    #[test]
    fn test_overrides_take_precedence() {
        let mut config = MetricsConfig::default();
        config.apply_env(vec![("METRICS_ADDRESS", "from-env")]).unwrap();

        let overrides = Overrides {
            address: Some("from-cli".to_string()),
            edge: Some(true),
            ..Overrides::default()
        };
        config.apply_overrides(&overrides);

        assert_eq!(config.connect.address, "from-cli");
        assert!(config.edge);
        assert_eq!(config.connect.port, DEFAULT_ROUTER_PORT);
    }

    /// Test semantic validation of stat groups from a file
    #[test]
    fn test_invalid_stat_group() {
        let config = MetricsConfig::from_toml_str(
            r#"
[[stats]]
entity = ""
attributes = ["x"]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    /// The shipped example configuration stays loadable
    #[test]
    fn test_example_file_parses() {
        let text = include_str!("../../../qdmetrics.example.toml");
        let config = MetricsConfig::from_toml_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stats.len(), 3);
        assert_eq!(config.stats[1].instance_label(), Some("link"));
        assert_eq!(config.connect.port, DEFAULT_ROUTER_PORT);
    }
}
