//! Per-cycle statistics collection.

use futures::future::try_join_all;
use qdmetrics_config::StatGroup;
use tracing::debug;

use crate::query::{with_name_attribute, RawQueryResult};
use crate::router_id::RouterId;
use crate::session::ManagementRequester;
use crate::ManagementResult;

/// Results indexed by stat group, then by router position in the topology.
pub type CollectedStats = Vec<Vec<RawQueryResult>>;

pub struct StatsCollector<'a, R: ?Sized> {
    requester: &'a R,
}

impl<'a, R> StatsCollector<'a, R>
where
    R: ManagementRequester + ?Sized,
{
    pub fn new(requester: &'a R) -> Self {
        Self { requester }
    }

    /// Queries every group on every router concurrently. `result[i][j]` is
    /// group `i` on `topology[j]`. A single failure fails the whole call.
    pub async fn collect(
        &self,
        topology: &[RouterId],
        groups: &[StatGroup],
    ) -> ManagementResult<CollectedStats> {
        let per_group = groups.iter().map(|group| {
            let attributes = with_name_attribute(&group.attributes);
            async move {
                let per_router = topology.iter().map(|router| {
                    self.requester
                        .send_query(router, &group.entity, &attributes)
                });
                try_join_all(per_router).await
            }
        });

        let collected = try_join_all(per_group).await?;
        debug!(
            groups = groups.len(),
            routers = topology.len(),
            "statistics collected"
        );
        Ok(collected)
    }
}
