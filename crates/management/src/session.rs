//! The management link session.
//!
//! One [`LinkSession`] owns one connection to a router with a dynamic-address
//! receiver for replies and a sender for requests. Requests are multiplexed
//! over the pair and matched back through the [`Correlator`].
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingLinks -> Connected
//!       ^                                            |
//!       +---------------- transport drop ------------+
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qdmetrics_amqp::{
    AmqpError, CommandSender, ConnectionCommand, ConnectionEvent, ConnectionHandle, Connector,
    RemoteOpen, TcpConnector, Value,
};
use qdmetrics_config::ConnectOptions;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, trace, warn};

use crate::correlator::Correlator;
use crate::hooks::{HookAction, HookKind, LifecycleEvent, LifecycleHooks};
use crate::query::{ManagementOperation, ManagementReply, ManagementRequest, RawQueryResult};
use crate::router_id::RouterId;
use crate::schema::{Schema, SchemaCache};
use crate::{ManagementError, ManagementResult};

/// Version reported when the router does not announce one.
pub const DEFAULT_ROUTER_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingLinks,
    Connected,
}

/// Issues management requests. Implemented by [`LinkSession`]; the topology
/// resolver and stats collector only depend on this.
#[async_trait]
pub trait ManagementRequester: Send + Sync {
    /// Node-level operation against the connected router.
    async fn send_management_query(
        &self,
        operation: ManagementOperation,
    ) -> ManagementResult<ManagementReply>;

    /// QUERY of `attribute_names` on every `entity` instance of `target`.
    async fn send_query(
        &self,
        target: &RouterId,
        entity: &str,
        attribute_names: &[String],
    ) -> ManagementResult<RawQueryResult>;

    /// Id of the router this session is connected to.
    fn connected_node(&self) -> ManagementResult<RouterId>;
}

#[derive(Debug)]
struct LinkState {
    commands: CommandSender,
    reply_to: String,
    remote: RemoteOpen,
    request_timeout: Duration,
    generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    link: Mutex<Option<LinkState>>,
    correlator: Correlator,
    schema: SchemaCache,
    hooks: LifecycleHooks,
    generation: AtomicU64,
}

/// Shared handle to the management session.
#[derive(Clone)]
pub struct LinkSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("state", &self.state())
            .field("pending", &self.inner.correlator.depth())
            .field("oldest_pending", &self.inner.correlator.oldest_pending())
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl LinkSession {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(SessionState::Disconnected),
                link: Mutex::new(None),
                correlator: Correlator::new(),
                schema: SchemaCache::new(),
                hooks: LifecycleHooks::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Session that connects over TCP, with TLS when configured.
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpConnector))
    }

    /// Opens the connection and both links within the setup timeout.
    pub async fn connect(&self, options: &ConnectOptions) -> ManagementResult<()> {
        if self.is_connected() {
            debug!("connect requested while already connected");
            return Ok(());
        }
        options.validate().map_err(AmqpError::from)?;

        self.set_state(SessionState::Connecting);
        let setup_timeout = options.setup_timeout();
        let attempt = tokio::time::timeout(setup_timeout, self.open_links(options)).await;

        let (handle, reply_to) = match attempt {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                // The partially opened handle was dropped with the future.
                self.set_state(SessionState::Disconnected);
                return Err(ManagementError::timeout("connection setup", setup_timeout));
            }
        };

        let ConnectionHandle {
            commands,
            events,
            remote,
        } = handle;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            endpoint = %options.endpoint(),
            container = %remote.container_id,
            reply_to = %reply_to,
            "connected to router"
        );

        *self.inner.link.lock() = Some(LinkState {
            commands,
            reply_to,
            remote,
            request_timeout: options.request_timeout(),
            generation,
        });
        self.set_state(SessionState::Connected);

        tokio::spawn(read_events(Arc::downgrade(&self.inner), events, generation));
        self.inner.hooks.fire(&LifecycleEvent::Connected);
        Ok(())
    }

    async fn open_links(
        &self,
        options: &ConnectOptions,
    ) -> ManagementResult<(ConnectionHandle, String)> {
        let mut handle = self.inner.connector.connect(options).await?;
        self.set_state(SessionState::AwaitingLinks);

        handle.commands.send(ConnectionCommand::OpenReceiver)?;
        let reply_to = loop {
            match next_setup_event(&mut handle.events).await? {
                ConnectionEvent::ReceiverOpened { address } => break address,
                other => trace!(?other, "waiting for receiver"),
            }
        };

        handle.commands.send(ConnectionCommand::OpenSender {
            address: options.sender_address.clone(),
        })?;
        let (mut opened, mut sendable) = (false, false);
        while !(opened && sendable) {
            match next_setup_event(&mut handle.events).await? {
                ConnectionEvent::SenderOpened => opened = true,
                ConnectionEvent::Sendable => sendable = true,
                other => trace!(?other, "waiting for sender"),
            }
        }

        Ok((handle, reply_to))
    }

    /// Closes both links and the connection. Close errors are ignored.
    pub fn disconnect(&self) {
        let generation = match self.inner.link.lock().as_ref() {
            Some(link) => {
                if let Err(e) = link.commands.send(ConnectionCommand::Close) {
                    debug!(error = %e, "close on a finished connection");
                }
                link.generation
            }
            None => return,
        };
        self.inner.teardown(generation, "disconnected by client");
    }

    /// True when the connection, both links and the reply address are all present.
    pub fn is_connected(&self) -> bool {
        if self.state() != SessionState::Connected {
            return false;
        }
        match self.inner.link.lock().as_ref() {
            Some(link) => !link.commands.is_closed() && !link.reply_to.is_empty(),
            None => false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.inner.state.lock();
        if *current != state {
            trace!(from = ?*current, to = ?state, "session state");
            *current = state;
        }
    }

    /// Sends a request and waits for its correlated reply.
    pub async fn request(&self, request: ManagementRequest) -> ManagementResult<ManagementReply> {
        let (commands, reply_to, timeout) = {
            let link = self.inner.link.lock();
            let link = link.as_ref().ok_or(ManagementError::NotConnected)?;
            (link.commands.clone(), link.reply_to.clone(), link.request_timeout)
        };

        let operation = request.operation;
        let correlator = &self.inner.correlator;
        let (id, reply) = correlator.allocate();
        let guard = correlator.guard(id);

        trace!(id, %operation, to = %request.to, "sending management request");
        commands.send(ConnectionCommand::Send(request.into_message(&reply_to, id)))?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(ManagementError::disconnected("request abandoned"))
            }
            Err(_) => {
                warn!(
                    id,
                    %operation,
                    pending = correlator.depth(),
                    oldest = ?correlator.oldest_pending(),
                    "management request timed out"
                );
                Err(ManagementError::timeout(operation.as_str(), timeout))
            }
        }
    }

    /// Fetches the schema, strips deprecated entries and caches it for this connection.
    pub async fn fetch_schema(&self) -> ManagementResult<Arc<Schema>> {
        let reply = self
            .send_management_query(ManagementOperation::GetSchema)
            .await?;
        let schema = Schema::from_reply(&reply.body)?;
        debug!(entities = schema.len(), "schema loaded");
        Ok(self.inner.schema.store(schema))
    }

    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.inner.schema.get()
    }

    /// Number of requests awaiting a reply.
    pub fn available_queue_depth(&self) -> usize {
        self.inner.correlator.depth()
    }

    pub fn reply_to(&self) -> Option<String> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.reply_to.clone())
    }

    /// Properties the router sent in its open frame.
    pub fn remote_properties(&self) -> Option<BTreeMap<String, Value>> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.remote.properties.clone())
    }

    /// Router software version, or [`DEFAULT_ROUTER_VERSION`] when not reported.
    pub fn version(&self) -> String {
        self.remote_properties()
            .and_then(|props| props.get("version").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_ROUTER_VERSION.to_string())
    }

    /// Runs once on the next successful connect.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.hooks.on_connect(callback);
    }

    /// Runs once on the next disconnect.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.inner.hooks.on_disconnect(callback);
    }

    /// Observer that stays registered until it returns [`HookAction::Remove`].
    pub fn subscribe<F>(&self, kind: HookKind, observer: F)
    where
        F: FnMut(&LifecycleEvent) -> HookAction + Send + 'static,
    {
        self.inner.hooks.subscribe(kind, observer);
    }
}

#[async_trait]
impl ManagementRequester for LinkSession {
    async fn send_management_query(
        &self,
        operation: ManagementOperation,
    ) -> ManagementResult<ManagementReply> {
        if !self.is_connected() {
            return Err(ManagementError::NotConnected);
        }
        self.request(ManagementRequest::node(operation)).await
    }

    async fn send_query(
        &self,
        target: &RouterId,
        entity: &str,
        attribute_names: &[String],
    ) -> ManagementResult<RawQueryResult> {
        if !self.is_connected() {
            return Err(ManagementError::NotConnected);
        }
        let entity_type = self.inner.schema.resolve_query(entity, attribute_names)?;
        let request = ManagementRequest::query(target.wire_address(), entity_type, attribute_names);
        let reply = self.request(request).await?;
        RawQueryResult::from_reply(&reply)
    }

    fn connected_node(&self) -> ManagementResult<RouterId> {
        let reply_to = self.reply_to().ok_or(ManagementError::NotConnected)?;
        RouterId::from_reply_to(&reply_to)
    }
}

impl Inner {
    /// Drops the link of `generation` if it is still current, fails every
    /// pending request and fires the disconnect observers.
    fn teardown(&self, generation: u64, reason: &str) {
        {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(current) if current.generation == generation => {
                    link.take();
                }
                _ => return,
            }
        }

        *self.state.lock() = SessionState::Disconnected;
        self.schema.clear();
        let failed = self
            .correlator
            .fail_all(|| ManagementError::disconnected(reason));
        error!(reason, failed_requests = failed, "router connection lost");

        self.hooks.fire(&LifecycleEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

async fn next_setup_event(
    events: &mut UnboundedReceiver<ConnectionEvent>,
) -> ManagementResult<ConnectionEvent> {
    match events.recv().await {
        Some(ConnectionEvent::Closed { reason }) => Err(ManagementError::connection(
            reason.unwrap_or_else(|| "closed during link setup".to_string()),
        )),
        Some(event) => Ok(event),
        None => Err(ManagementError::connection("connection task exited during link setup")),
    }
}

/// Dispatches inbound replies until the connection ends.
async fn read_events(
    inner: Weak<Inner>,
    mut events: UnboundedReceiver<ConnectionEvent>,
    generation: u64,
) {
    let reason = loop {
        match events.recv().await {
            Some(ConnectionEvent::Message(message)) => {
                let Some(inner) = inner.upgrade() else { return };
                inner.correlator.resolve(message);
            }
            Some(ConnectionEvent::Closed { reason }) => {
                break reason.unwrap_or_else(|| "connection closed".to_string())
            }
            Some(other) => trace!(?other, "link event"),
            None => break "connection task exited".to_string(),
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.teardown(generation, &reason);
    }
}
