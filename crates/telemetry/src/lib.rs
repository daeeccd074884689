//! # qdmetrics telemetry
//!
//! Process logging for the exporter: `tracing-subscriber` with an
//! `EnvFilter`, text, compact or JSON output, and an optional non-blocking
//! log file.

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LogConfig, LogFormat, LogGuard};

use qdmetrics_config::LoggingSettings;

/// Initialize logging from the `[log]` section of the configuration
pub fn init(settings: &LoggingSettings) -> TelemetryResult<LogGuard> {
    init_logging(&LogConfig::from_settings(settings)?)
}
