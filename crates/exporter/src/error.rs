//! Exporter error types

use qdmetrics_management::ManagementError;
use thiserror::Error;

/// Errors raised while collecting, rendering or serving metrics
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Management request or session failure
    #[error("Management error: {0}")]
    Management(#[from] ManagementError),

    /// Gauge registration or encoding failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Nothing has been discovered yet
    #[error("No topology available")]
    NoTopology,

    /// Schema has not been loaded on the current connection
    #[error("No gauges available: schema not loaded")]
    NoGauges,

    /// HTTP listener failure
    #[error("Server error: {message}")]
    Server {
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExporterError {
    /// Create a server error
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::Server {
            message: message.into(),
        }
    }
}

impl From<hyper::Error> for ExporterError {
    fn from(e: hyper::Error) -> Self {
        Self::server(e.to_string())
    }
}

/// Result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;
