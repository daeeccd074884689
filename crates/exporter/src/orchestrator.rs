//! Scrape orchestration.
//!
//! The run loop keeps the session connected, refreshes the topology on the
//! `refresh` timer and, when caching, polls statistics on the `poll` timer.
//! Both timers only run while connected and after the schema was fetched on
//! that connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use qdmetrics_config::MetricsConfig;
use qdmetrics_management::{
    DiscoveryOptions, HookAction, HookKind, LifecycleEvent, LinkSession, StatsCollector,
    TopologyResolver,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::gauges::{content_type, GaugeSet};
use crate::snapshot::{SnapshotStore, StatsSnapshot, TopologySnapshot};
use crate::{ExporterError, ExporterResult};

/// Delay before reconnecting after a lost connection.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(100);
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Answer to a scrape request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeResponse {
    Metrics { content_type: String, body: Vec<u8> },
    ServiceUnavailable,
}

/// Serves scrape requests.
#[async_trait]
pub trait ScrapeHandler: Send + Sync {
    async fn on_scrape_request(&self) -> ScrapeResponse;
}

/// Exponential delay between connection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay before the next attempt; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Exit {
    Shutdown,
    Lost(String),
}

/// Owns the session-driven refresh cycle and the snapshots scrapes read.
pub struct ScrapeOrchestrator {
    session: LinkSession,
    config: Arc<MetricsConfig>,
    store: SnapshotStore,
    gauges: RwLock<Option<Arc<GaugeSet>>>,
}

impl std::fmt::Debug for ScrapeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeOrchestrator")
            .field("session", &self.session)
            .field("cache", &self.config.cache)
            .finish()
    }
}

impl ScrapeOrchestrator {
    pub fn new(session: LinkSession, config: MetricsConfig) -> Self {
        Self {
            session,
            config: Arc::new(config),
            store: SnapshotStore::new(),
            gauges: RwLock::new(None),
        }
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn topology(&self) -> Option<Arc<TopologySnapshot>> {
        self.store.topology()
    }

    pub fn last_stats(&self) -> Option<Arc<StatsSnapshot>> {
        self.store.stats()
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> ExporterResult<()> {
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        self.session.subscribe(HookKind::Disconnect, move |event| {
            if let LifecycleEvent::Disconnected { reason } = event {
                let _ = lost_tx.send(reason.clone());
            }
            HookAction::Keep
        });

        let mut backoff = Backoff::default();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                _ = shutdown.changed() => break,
                attempt = self.establish() => attempt,
            };
            if let Err(e) = attempt {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "router connection attempt failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            backoff.reset();

            // Signals from connections before this one are stale.
            while lost_rx.try_recv().is_ok() {}
            if !self.session.is_connected() {
                continue;
            }

            match self.run_connected(&mut lost_rx, &mut shutdown).await {
                Exit::Shutdown => break,
                Exit::Lost(reason) => {
                    info!(%reason, "reconnecting to router");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        self.session.disconnect();
        info!("scrape orchestrator stopped");
        Ok(())
    }

    /// Connects, loads the schema and the first topology, and primes the cache.
    async fn establish(&self) -> ExporterResult<()> {
        self.session.connect(&self.config.connect).await?;
        let schema = match self.session.fetch_schema().await {
            Ok(schema) => schema,
            Err(e) => {
                self.session.disconnect();
                return Err(e.into());
            }
        };
        *self.gauges.write() = Some(Arc::new(GaugeSet::new(&self.config.stats, Some(&schema))));
        info!(version = %self.session.version(), "router schema loaded");

        if let Err(e) = self.refresh_topology().await {
            warn!(error = %e, "initial topology discovery failed");
            return Ok(());
        }
        if self.config.cache {
            if let Err(e) = self.poll_stats().await {
                warn!(error = %e, "initial statistics collection failed");
            }
        }
        Ok(())
    }

    async fn run_connected(
        &self,
        lost: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let refresh_every = self.config.refresh_interval().max(MIN_TIMER_PERIOD);
        let poll_every = self.config.poll_interval().max(MIN_TIMER_PERIOD);
        let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Exit::Shutdown,
                reason = lost.recv() => {
                    return Exit::Lost(reason.unwrap_or_else(|| "connection lost".to_string()));
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_topology().await {
                        warn!(error = %e, "topology refresh failed");
                    }
                }
                _ = poll.tick(), if self.config.cache => {
                    if let Err(e) = self.poll_stats().await {
                        warn!(error = %e, "statistics poll failed; keeping last snapshot");
                    }
                }
            }
        }
    }

    /// Discovers the topology and installs it as the current snapshot.
    pub async fn refresh_topology(&self) -> ExporterResult<Arc<TopologySnapshot>> {
        let options = DiscoveryOptions::new(self.config.local, self.config.edge);
        let routers = TopologyResolver::new(&self.session).discover(options).await?;

        let changed = self
            .store
            .topology()
            .map_or(true, |current| current.routers != routers);
        if changed {
            let names: Vec<&str> = routers.iter().map(|r| r.name()).collect();
            info!(routers = ?names, "router topology changed");
        }

        let snapshot = self.store.replace_topology(routers);
        debug!(generation = snapshot.generation, "topology refreshed");
        Ok(snapshot)
    }

    /// Collects every stat group against the current topology.
    pub async fn collect(&self) -> ExporterResult<StatsSnapshot> {
        let topology = self.store.topology().ok_or(ExporterError::NoTopology)?;
        let gauges = self.gauges.read().clone().ok_or(ExporterError::NoGauges)?;
        let results = StatsCollector::new(&self.session)
            .collect(&topology.routers, &self.config.stats)
            .await?;
        Ok(StatsSnapshot::new(topology, results, gauges))
    }

    /// Collects and stores a new snapshot unless a newer one is already stored.
    pub async fn poll_stats(&self) -> ExporterResult<Arc<StatsSnapshot>> {
        let snapshot = Arc::new(self.collect().await?);
        self.store.store_stats(snapshot.clone());
        debug!(generation = snapshot.topology.generation, "statistics polled");
        Ok(snapshot)
    }

    fn respond(snapshot: &StatsSnapshot) -> ScrapeResponse {
        match snapshot.render() {
            Ok(body) => ScrapeResponse::Metrics {
                content_type: content_type(),
                body,
            },
            Err(e) => {
                error!(error = %e, "failed to render metrics");
                ScrapeResponse::ServiceUnavailable
            }
        }
    }
}

#[async_trait]
impl ScrapeHandler for ScrapeOrchestrator {
    async fn on_scrape_request(&self) -> ScrapeResponse {
        if self.config.cache {
            return match self.store.stats() {
                Some(snapshot) => Self::respond(&snapshot),
                None => {
                    debug!("scrape before the first statistics poll");
                    ScrapeResponse::ServiceUnavailable
                }
            };
        }

        if !self.session.is_connected() {
            debug!("scrape while disconnected");
            return ScrapeResponse::ServiceUnavailable;
        }
        match self.collect().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.store.store_stats(snapshot.clone());
                Self::respond(&snapshot)
            }
            Err(e) => {
                warn!(error = %e, "live collection failed");
                ScrapeResponse::ServiceUnavailable
            }
        }
    }
}
