//! Topology and statistics snapshots, replaced by swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use qdmetrics_management::{CollectedStats, RouterId};
use tracing::debug;

use crate::gauges::GaugeSet;
use crate::ExporterResult;

/// Routers found by one discovery cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub generation: u64,
    pub routers: Vec<RouterId>,
    pub discovered_at: Instant,
}

/// One collection cycle, with the topology and gauges it belongs to.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub topology: Arc<TopologySnapshot>,
    pub results: CollectedStats,
    pub gauges: Arc<GaugeSet>,
    pub collected_at: Instant,
}

impl StatsSnapshot {
    pub fn new(topology: Arc<TopologySnapshot>, results: CollectedStats, gauges: Arc<GaugeSet>) -> Self {
        Self {
            topology,
            results,
            gauges,
            collected_at: Instant::now(),
        }
    }

    /// Prometheus text for this snapshot alone.
    pub fn render(&self) -> ExporterResult<Vec<u8>> {
        self.gauges.render(&self.topology.routers, &self.results)
    }
}

/// Current topology and last good statistics.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    topology: RwLock<Option<Arc<TopologySnapshot>>>,
    stats: RwLock<Option<Arc<StatsSnapshot>>>,
    generation: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new topology with the next generation number.
    pub fn replace_topology(&self, routers: Vec<RouterId>) -> Arc<TopologySnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(TopologySnapshot {
            generation,
            routers,
            discovered_at: Instant::now(),
        });
        *self.topology.write() = Some(snapshot.clone());
        snapshot
    }

    pub fn topology(&self) -> Option<Arc<TopologySnapshot>> {
        self.topology.read().clone()
    }

    /// Stores `snapshot` unless the stored one was collected against a newer
    /// topology. Returns whether it was stored.
    pub fn store_stats(&self, snapshot: Arc<StatsSnapshot>) -> bool {
        let mut current = self.stats.write();
        if let Some(existing) = current.as_ref() {
            if existing.topology.generation > snapshot.topology.generation {
                debug!(
                    stored = existing.topology.generation,
                    collected = snapshot.topology.generation,
                    "discarding statistics from a superseded topology"
                );
                return false;
            }
        }
        *current = Some(snapshot);
        true
    }

    pub fn stats(&self) -> Option<Arc<StatsSnapshot>> {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdmetrics_management::RouterKind;

    fn routers(names: &[&str]) -> Vec<RouterId> {
        names
            .iter()
            .map(|n| RouterId::from_name(*n, RouterKind::Interior))
            .collect()
    }

    #[test]
    fn test_generations_increase() {
        let store = SnapshotStore::new();
        assert!(store.topology().is_none());

        let first = store.replace_topology(routers(&["R1"]));
        let second = store.replace_topology(routers(&["R1", "R2"]));
        assert!(second.generation > first.generation);
        assert_eq!(store.topology().unwrap().routers.len(), 2);
        // Readers holding the old snapshot still see it unchanged.
        assert_eq!(first.routers.len(), 1);
    }

    #[test]
    fn test_superseded_stats_discarded() {
        let store = SnapshotStore::new();
        let gauges = Arc::new(GaugeSet::default());
        let old = store.replace_topology(routers(&["R1"]));
        let new = store.replace_topology(routers(&["R1", "R2"]));

        assert!(store.store_stats(Arc::new(StatsSnapshot::new(new.clone(), vec![], gauges.clone()))));
        assert!(!store.store_stats(Arc::new(StatsSnapshot::new(old, vec![], gauges.clone()))));
        assert_eq!(store.stats().unwrap().topology.generation, new.generation);

        // Same generation replaces.
        assert!(store.store_stats(Arc::new(StatsSnapshot::new(new, vec![], gauges))));
    }
}
