//! # qdmetrics management
//!
//! Management-protocol client for router networks: the link session with its
//! correlator, the per-connection schema cache, topology discovery and
//! statistics collection.

pub mod correlator;
pub mod error;
pub mod hooks;
pub mod query;
pub mod router_id;
pub mod schema;
pub mod session;
pub mod stats;
pub mod topology;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use correlator::{Correlator, PendingGuard, ReplyReceiver};
pub use error::{ManagementError, ManagementResult, SchemaError};
pub use hooks::{HookAction, HookKind, LifecycleEvent, LifecycleHooks};
pub use query::{
    flatten, with_name_attribute, ManagementOperation, ManagementReply, ManagementRequest,
    RawQueryResult, Record, MANAGEMENT_NODE, MANAGEMENT_TYPE,
};
pub use router_id::{RouterId, RouterKind};
pub use schema::{AttributeSchema, EntitySchema, Schema, SchemaCache};
pub use session::{LinkSession, ManagementRequester, SessionState, DEFAULT_ROUTER_VERSION};
pub use stats::{CollectedStats, StatsCollector};
pub use topology::{DiscoveryOptions, TopologyResolver};
