//! In-process router fake for tests.
//!
//! [`FakeRouter`] implements [`Connector`] and answers GET-SCHEMA,
//! GET-MGMT-NODES and QUERY requests from tables configured by the test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use qdmetrics_amqp::{
    AmqpError, AmqpResult, ConnectionCommand, ConnectionEvent, ConnectionHandle, Connector,
    Message, PeerEnd, RemoteOpen, Value,
};
use qdmetrics_config::ConnectOptions;
use tokio::sync::oneshot;

use crate::router_id::{RouterId, RouterKind};

const TYPE_PREFIX: &str = "org.apache.qpid.dispatch.";

/// A request the fake has seen.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub operation: String,
    pub to: Option<String>,
    pub entity_type: Option<String>,
    pub attribute_names: Vec<String>,
}

#[derive(Debug, Clone)]
struct Table {
    attribute_names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct Network {
    connected: String,
    version: Option<String>,
    schema: Value,
    nodes: Vec<RouterId>,
    known: HashSet<RouterId>,
    tables: HashMap<(RouterId, String), Table>,
    silent: HashSet<RouterId>,
    refuse_connect: bool,
    stall_links: bool,
    requests: Vec<RecordedRequest>,
}

/// A fake router network reachable through one connected router.
#[derive(Debug, Clone)]
pub struct FakeRouter {
    network: Arc<Mutex<Network>>,
    kills: Arc<Mutex<Vec<oneshot::Sender<String>>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeRouter {
    /// A lone interior router named `name` with the default schema.
    pub fn new(name: &str) -> Self {
        let connected = RouterId::from_name(name, RouterKind::Interior);
        let mut known = HashSet::new();
        known.insert(connected.clone());
        Self {
            network: Arc::new(Mutex::new(Network {
                connected: name.to_string(),
                version: None,
                schema: default_schema(),
                nodes: Vec::new(),
                known,
                tables: HashMap::new(),
                silent: HashSet::new(),
                refuse_connect: false,
                stall_links: false,
                requests: Vec::new(),
            })),
            kills: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connected_id(&self) -> RouterId {
        RouterId::from_name(self.network.lock().connected.clone(), RouterKind::Interior)
    }

    /// Interior routers returned by GET-MGMT-NODES.
    pub fn with_nodes(self, names: &[&str]) -> Self {
        {
            let mut network = self.network.lock();
            network.nodes = names
                .iter()
                .map(|name| RouterId::from_name(*name, RouterKind::Interior))
                .collect();
            let nodes = network.nodes.clone();
            network.known.extend(nodes);
        }
        self
    }

    pub fn with_version(self, version: &str) -> Self {
        self.network.lock().version = Some(version.to_string());
        self
    }

    pub fn with_schema(self, schema: Value) -> Self {
        self.network.lock().schema = schema;
        self
    }

    pub fn with_entity(
        self,
        router: &RouterId,
        entity: &str,
        attribute_names: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Self {
        self.set_entity(router, entity, attribute_names, rows);
        self
    }

    /// Replaces the instances of `entity` on `router`.
    pub fn set_entity(
        &self,
        router: &RouterId,
        entity: &str,
        attribute_names: &[&str],
        rows: Vec<Vec<Value>>,
    ) {
        let mut network = self.network.lock();
        network.known.insert(router.clone());
        network.tables.insert(
            (router.clone(), format!("{TYPE_PREFIX}{entity}")),
            Table {
                attribute_names: attribute_names.iter().map(|s| s.to_string()).collect(),
                rows,
            },
        );
    }

    /// Adds an edge connection row to `router`'s connection table.
    pub fn with_edge(self, router: &RouterId, edge: &str) -> Self {
        {
            let mut network = self.network.lock();
            let key = (router.clone(), format!("{TYPE_PREFIX}connection"));
            let table = network.tables.entry(key).or_insert_with(|| Table {
                attribute_names: vec!["role".into(), "container".into()],
                rows: Vec::new(),
            });
            table
                .rows
                .push(vec![Value::from("edge"), Value::from(edge)]);
            network
                .known
                .insert(RouterId::from_name(edge, RouterKind::Edge));
        }
        self
    }

    /// Requests to `router` are recorded but never answered.
    pub fn silence(&self, router: &RouterId) {
        self.network.lock().silent.insert(router.clone());
    }

    pub fn unsilence(&self, router: &RouterId) {
        self.network.lock().silent.remove(router);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.network.lock().refuse_connect = refuse;
    }

    /// Accepts connections but never opens links.
    pub fn stall_links(&self, stall: bool) {
        self.network.lock().stall_links = stall;
    }

    /// Closes every open connection from the router side.
    pub fn drop_connections(&self, reason: &str) {
        for kill in self.kills.lock().drain(..) {
            let _ = kill.send(reason.to_string());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.network.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.network.lock().requests.clear();
    }
}

#[async_trait]
impl Connector for FakeRouter {
    async fn connect(&self, _options: &ConnectOptions) -> AmqpResult<ConnectionHandle> {
        let (name, version) = {
            let network = self.network.lock();
            if network.refuse_connect {
                return Err(AmqpError::connection_failed("connection refused"));
            }
            (network.connected.clone(), network.version.clone())
        };

        let mut properties = std::collections::BTreeMap::new();
        if let Some(version) = version {
            properties.insert("version".to_string(), Value::String(version));
        }
        let (handle, peer) = ConnectionHandle::pair(RemoteOpen {
            container_id: name.clone(),
            properties,
            max_frame_size: 65536,
            idle_timeout: None,
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kills.lock().push(kill_tx);
        let serial = self.connections.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(serve(self.network.clone(), peer, kill_rx, name, serial));
        Ok(handle)
    }
}

async fn serve(
    network: Arc<Mutex<Network>>,
    mut peer: PeerEnd,
    mut kill: oneshot::Receiver<String>,
    name: String,
    serial: usize,
) {
    loop {
        tokio::select! {
            command = peer.commands.recv() => match command {
                Some(ConnectionCommand::OpenReceiver) => {
                    if network.lock().stall_links {
                        continue;
                    }
                    let address = format!("amqp:/_topo/0/{name}/temp.{serial}");
                    let _ = peer.events.send(ConnectionEvent::ReceiverOpened { address });
                }
                Some(ConnectionCommand::OpenSender { .. }) => {
                    let _ = peer.events.send(ConnectionEvent::SenderOpened);
                    let _ = peer.events.send(ConnectionEvent::Sendable);
                }
                Some(ConnectionCommand::Send(message)) => {
                    if let Some(reply) = answer(&network, message) {
                        let _ = peer.events.send(ConnectionEvent::Message(reply));
                    }
                }
                Some(ConnectionCommand::Close) | None => {
                    let _ = peer.events.send(ConnectionEvent::Closed { reason: None });
                    return;
                }
            },
            reason = &mut kill => {
                let reason = reason.unwrap_or_else(|_| "router stopped".to_string());
                let _ = peer.events.send(ConnectionEvent::Closed { reason: Some(reason) });
                return;
            }
        }
    }
}

fn answer(network: &Mutex<Network>, request: Message) -> Option<Message> {
    let mut network = network.lock();
    let operation = request
        .application_property("operation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let entity_type = request
        .application_property("entityType")
        .and_then(Value::as_str)
        .map(str::to_string);
    let attribute_names: Vec<String> = request
        .body
        .as_ref()
        .and_then(|body| body.get("attributeNames"))
        .and_then(Value::as_list)
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    network.requests.push(RecordedRequest {
        operation: operation.clone(),
        to: request.properties.to.clone(),
        entity_type: entity_type.clone(),
        attribute_names: attribute_names.clone(),
    });

    let connected = RouterId::from_name(network.connected.clone(), RouterKind::Interior);
    let target = match request.properties.to.as_deref() {
        Some(to) if to != "/$management" => RouterId::parse(&format!("amqp:/{to}")).ok(),
        _ => Some(connected),
    };
    if target.as_ref().map_or(false, |t| network.silent.contains(t)) {
        return None;
    }

    let outcome = match (operation.as_str(), target) {
        ("GET-SCHEMA", _) => Ok(network.schema.clone()),
        ("GET-MGMT-NODES", _) => Ok(Value::List(
            network
                .nodes
                .iter()
                .map(|id| Value::from(id.address()))
                .collect(),
        )),
        ("QUERY", Some(target)) if network.known.contains(&target) => {
            let table = entity_type
                .and_then(|t| network.tables.get(&(target, t)))
                .cloned()
                .unwrap_or(Table {
                    attribute_names: Vec::new(),
                    rows: Vec::new(),
                });
            Ok(project(&table, &attribute_names))
        }
        ("QUERY", _) => Err((404, "Not Found")),
        _ => Err((501, "Not Implemented")),
    };

    let mut reply = Message::new();
    if let Some(reply_to) = request.properties.reply_to.clone() {
        reply = reply.with_to(reply_to);
    }
    if let Some(id) = request.correlation_id().cloned() {
        reply = reply.with_correlation_id(id);
    }
    Some(match outcome {
        Ok(body) => reply
            .with_application_property("statusCode", Value::Int(200))
            .with_application_property("statusDescription", "OK")
            .with_body(body),
        Err((code, description)) => reply
            .with_application_property("statusCode", Value::Int(code))
            .with_application_property("statusDescription", description),
    })
}

/// Keeps the requested columns, in request order. Unknown columns are null.
fn project(table: &Table, requested: &[String]) -> Value {
    let columns: Vec<Option<usize>> = requested
        .iter()
        .map(|name| table.attribute_names.iter().position(|a| a == name))
        .collect();
    let rows = table
        .rows
        .iter()
        .map(|row| {
            Value::List(
                columns
                    .iter()
                    .map(|col| col.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect();
    Value::string_map([
        (
            "attributeNames",
            Value::List(requested.iter().map(|n| Value::from(n.as_str())).collect()),
        ),
        ("results", Value::List(rows)),
    ])
}

fn entity_schema<I, S>(entity: &str, attributes: I, deprecated: bool) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let attributes: Vec<(String, Value)> = attributes
        .into_iter()
        .map(|attr| {
            let attr = attr.as_ref();
            (
                attr.to_string(),
                Value::string_map([
                    ("description", Value::from(format!("{entity} {attr}"))),
                    ("deprecated", Value::Bool(false)),
                ]),
            )
        })
        .collect();
    Value::string_map([
        ("fullyQualifiedType", Value::from(format!("{TYPE_PREFIX}{entity}"))),
        ("deprecated", Value::Bool(deprecated)),
        ("attributes", Value::string_map(attributes)),
    ])
}

/// Schema covering the default stat groups plus `connection` and a
/// deprecated `container` entity.
pub fn default_schema() -> Value {
    let mut entities: Vec<(String, Value)> = qdmetrics_config::default_stat_groups()
        .into_iter()
        .map(|group| {
            let attributes = group.attributes.iter().map(String::as_str).chain(["name"]);
            let schema = entity_schema(&group.entity, attributes, false);
            (group.entity, schema)
        })
        .collect();
    entities.push((
        "connection".to_string(),
        entity_schema("connection", ["name", "role", "container", "host"], false),
    ));
    entities.push(("container".to_string(), entity_schema("container", ["name"], true)));

    Value::string_map([("entityTypes", Value::string_map(entities))])
}
