//! # qdmetrics exporter
//!
//! Drives discovery and collection on timers, keeps the last good snapshot
//! and serves it as Prometheus text over HTTP.

mod error;
pub mod gauges;
pub mod orchestrator;
pub mod server;
pub mod snapshot;

pub use error::{ExporterError, ExporterResult};
pub use gauges::{GaugeSet, GaugeSpec};
pub use orchestrator::{Backoff, ScrapeHandler, ScrapeOrchestrator, ScrapeResponse};
pub use snapshot::{SnapshotStore, StatsSnapshot, TopologySnapshot};
