//! Management node addresses.
//!
//! Interior routers are addressed as `amqp:/_topo/0/<name>/$management`, edge
//! routers as `amqp:/_edge/<name>/$management`. Router names may contain `/`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{ManagementError, ManagementResult};

const MANAGEMENT_SEGMENT: &str = "$management";
const INTERIOR_SEGMENT: &str = "_topo";
const EDGE_SEGMENT: &str = "_edge";
const AREA: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterKind {
    Interior,
    Edge,
}

impl RouterKind {
    fn segment(self) -> &'static str {
        match self {
            RouterKind::Interior => INTERIOR_SEGMENT,
            RouterKind::Edge => EDGE_SEGMENT,
        }
    }
}

impl fmt::Display for RouterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterKind::Interior => f.write_str("interior"),
            RouterKind::Edge => f.write_str("edge"),
        }
    }
}

/// Address of a router's management node.
///
/// Equality and hashing use the router name and kind only.
#[derive(Debug, Clone)]
pub struct RouterId {
    address: String,
    kind: RouterKind,
    name: String,
}

impl RouterId {
    /// Parses a management address such as `amqp:/_topo/0/R1/$management`.
    pub fn parse(address: &str) -> ManagementResult<Self> {
        let parts: Vec<&str> = address.split('/').collect();
        if parts.len() < 4 {
            return Err(ManagementError::protocol(format!(
                "not a router management address: {address}"
            )));
        }

        let kind = match parts[1] {
            INTERIOR_SEGMENT => RouterKind::Interior,
            EDGE_SEGMENT => RouterKind::Edge,
            other => {
                return Err(ManagementError::protocol(format!(
                    "unknown router address class {other} in {address}"
                )))
            }
        };

        let mut name_parts = &parts[2..parts.len() - 1];
        if kind == RouterKind::Interior && name_parts.first() == Some(&AREA) {
            name_parts = &name_parts[1..];
        }
        let name = name_parts.join("/");
        if name.is_empty() {
            return Err(ManagementError::protocol(format!(
                "router address without a name: {address}"
            )));
        }

        Ok(Self {
            address: address.to_string(),
            kind,
            name,
        })
    }

    /// Builds the management address of a router from its name.
    pub fn from_name(name: impl Into<String>, kind: RouterKind) -> Self {
        let name = name.into();
        let segment = kind.segment();
        let address = match kind {
            RouterKind::Interior => format!("amqp:/{segment}/{AREA}/{name}/{MANAGEMENT_SEGMENT}"),
            RouterKind::Edge => format!("amqp:/{segment}/{name}/{MANAGEMENT_SEGMENT}"),
        };
        Self {
            address,
            kind,
            name,
        }
    }

    /// Management node of the router that assigned a dynamic reply address.
    pub fn from_reply_to(reply_to: &str) -> ManagementResult<Self> {
        let Some((prefix, _)) = reply_to.rsplit_once('/') else {
            return Err(ManagementError::protocol(format!(
                "reply address has no path: {reply_to}"
            )));
        };
        Self::parse(&format!("{prefix}/{MANAGEMENT_SEGMENT}"))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Human-readable router name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RouterKind {
        self.kind
    }

    /// The `to` address used on the wire: the address without its scheme segment.
    pub fn wire_address(&self) -> String {
        match self.address.split_once('/') {
            Some((_, rest)) => rest.to_string(),
            None => self.address.clone(),
        }
    }
}

impl PartialEq for RouterId {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl Eq for RouterId {}

impl Hash for RouterId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
    }
}

impl FromStr for RouterId {
    type Err = ManagementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
