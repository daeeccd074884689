//! # qdmetrics: Prometheus exporter for Qpid Dispatch router networks
//!
//! Connects to a single router over AMQP, uses its management node to
//! discover the other interior and edge routers, queries configured entity
//! attributes on each of them and publishes the numeric values as gauges.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qdmetrics::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MetricsConfig::default();
//!     let orchestrator = Arc::new(ScrapeOrchestrator::new(LinkSession::tcp(), config));
//!     let (_stop, stopped) = tokio::sync::watch::channel(false);
//!     orchestrator.run(stopped).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - configuration file, environment and command line layers
//! - [`amqp`] - AMQP 1.0 framing, SASL, TLS and the connection task
//! - [`management`] - link session, correlator, schema, topology and stats
//! - [`telemetry`] - process logging
//! - [`exporter`] - gauges, snapshots, the orchestrator and the HTTP endpoint

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use qdmetrics_amqp as amqp;
pub use qdmetrics_config as config;
pub use qdmetrics_exporter as exporter;
pub use qdmetrics_management as management;
pub use qdmetrics_telemetry as telemetry;

/// Common imports for embedding the exporter
pub mod prelude {
    pub use crate::config::{ConnectOptions, MetricsConfig, StatGroup};
    pub use crate::exporter::{ScrapeHandler, ScrapeOrchestrator, ScrapeResponse};
    pub use crate::management::{
        LinkSession, ManagementRequester, RouterId, RouterKind, StatsCollector, TopologyResolver,
    };
}

/// qdmetrics library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
