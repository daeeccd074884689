//! Router topology discovery.

use futures::future::try_join_all;
use qdmetrics_amqp::Value;
use tracing::{debug, info};

use crate::query::ManagementOperation;
use crate::router_id::{RouterId, RouterKind};
use crate::session::ManagementRequester;
use crate::{ManagementError, ManagementResult};

const CONNECTION_ENTITY: &str = "connection";
const EDGE_ROLE: &str = "edge";

/// What to discover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Only the connected router (plus its edges when `edge` is set).
    pub local: bool,
    /// Also discover edge routers attached to each interior router.
    pub edge: bool,
}

impl DiscoveryOptions {
    pub fn new(local: bool, edge: bool) -> Self {
        Self { local, edge }
    }
}

/// Walks the router network starting from the connected node.
pub struct TopologyResolver<'a, R: ?Sized> {
    requester: &'a R,
}

impl<'a, R> TopologyResolver<'a, R>
where
    R: ManagementRequester + ?Sized,
{
    pub fn new(requester: &'a R) -> Self {
        Self { requester }
    }

    /// Interior routers first, then edge routers in the order their interior
    /// routers were listed. Edge routers are not deduplicated. Any failed
    /// query fails the whole discovery.
    pub async fn discover(&self, options: DiscoveryOptions) -> ManagementResult<Vec<RouterId>> {
        let mut routers = if options.local {
            vec![self.requester.connected_node()?]
        } else {
            self.interior_routers().await?
        };

        if options.edge {
            let edges = try_join_all(routers.iter().map(|router| self.edge_routers(router))).await?;
            routers.extend(edges.into_iter().flatten());
        }

        info!(
            routers = routers.len(),
            local = options.local,
            edge = options.edge,
            "topology discovered"
        );
        Ok(routers)
    }

    async fn interior_routers(&self) -> ManagementResult<Vec<RouterId>> {
        let reply = self
            .requester
            .send_management_query(ManagementOperation::GetMgmtNodes)
            .await?;
        let nodes = reply.body.as_list().ok_or_else(|| {
            ManagementError::protocol(format!("GET-MGMT-NODES returned a non-array: {}", reply.body))
        })?;

        // The node list omits the router answering it when it is alone.
        if nodes.is_empty() {
            return Ok(vec![self.requester.connected_node()?]);
        }

        nodes
            .iter()
            .map(|node| {
                let address = node.as_str().ok_or_else(|| {
                    ManagementError::protocol(format!("management node is not an address: {node}"))
                })?;
                RouterId::parse(address)
            })
            .collect()
    }

    async fn edge_routers(&self, router: &RouterId) -> ManagementResult<Vec<RouterId>> {
        let attributes = ["role".to_string(), "container".to_string()];
        let result = self
            .requester
            .send_query(router, CONNECTION_ENTITY, &attributes)
            .await?;

        let edges: Vec<RouterId> = result
            .records()
            .into_iter()
            .filter(|record| record.get("role").and_then(Value::as_str) == Some(EDGE_ROLE))
            .filter_map(|record| {
                record
                    .get("container")
                    .and_then(Value::as_str)
                    .map(|container| RouterId::from_name(container, RouterKind::Edge))
            })
            .collect();

        debug!(router = router.name(), edges = edges.len(), "edge routers found");
        Ok(edges)
    }
}
