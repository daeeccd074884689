//! Statistic group descriptors.

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// One batch of statistics: a router entity and the attributes to read from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatGroup {
    /// Entity short name as it appears in the router schema (`router`, `router.link`, ...)
    pub entity: String,
    /// Attribute names to export as gauges
    pub attributes: Vec<String>,
    /// Label key used for the entity instance name instead of the entity name
    #[serde(default)]
    pub alias: Option<String>,
}

impl StatGroup {
    /// Creates a group without an alias
    pub fn new<I, S>(entity: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity: entity.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            alias: None,
        }
    }

    /// Sets the label alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Label key for the entity instance, `None` for the `router` entity itself
    pub fn instance_label(&self) -> Option<&str> {
        if self.entity == "router" {
            None
        } else {
            Some(self.alias.as_deref().unwrap_or(&self.entity))
        }
    }

    /// Checks the group is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.entity.is_empty() {
            return Err(ConfigError::invalid("stat group entity must not be empty"));
        }
        if self.attributes.is_empty() {
            return Err(ConfigError::invalid(format!(
                "stat group '{}' has no attributes",
                self.entity
            )));
        }
        if self.attributes.iter().any(|a| a.is_empty()) {
            return Err(ConfigError::invalid(format!(
                "stat group '{}' has an empty attribute name",
                self.entity
            )));
        }
        Ok(())
    }
}

/// Statistics collected when the configuration does not list any
pub fn default_stat_groups() -> Vec<StatGroup> {
    vec![
        StatGroup::new(
            "router",
            [
                "addrCount",
                "linkCount",
                "nodeCount",
                "connectionCount",
                "presettledDeliveries",
                "droppedPresettledDeliveries",
                "acceptedDeliveries",
                "rejectedDeliveries",
                "releasedDeliveries",
                "modifiedDeliveries",
                "deliveriesIngress",
                "deliveriesEgress",
                "deliveriesTransit",
                "deliveriesIngressRouteContainer",
                "deliveriesEgressRouteContainer",
                "deliveriesDelayed1Sec",
                "deliveriesDelayed10Sec",
                "deliveriesStuck",
                "linksBlocked",
            ],
        ),
        StatGroup::new(
            "router.link",
            [
                "deliveryCount",
                "undeliveredCount",
                "unsettledCount",
                "settleRate",
                "capacity",
            ],
        )
        .with_alias("link"),
        StatGroup::new(
            "router.address",
            [
                "deliveriesFromContainer",
                "deliveriesToContainer",
                "subscriberCount",
                "remoteCount",
                "containerCount",
            ],
        )
        .with_alias("address"),
    ]
}
