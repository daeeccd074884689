//! Connection establishment and the per-connection driver task.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use qdmetrics_config::ConnectOptions;

use crate::frame::{Frame, FrameCodec, FrameType, ProtocolId, Wire};
use crate::performative::{
    Attach, Begin, Detach, Disposition, Flow, Open, Performative, Role, Terminus, Transfer,
};
use crate::sasl::{Credentials, SaslFrame};
use crate::{tls, AmqpError, AmqpResult, Message, Value};

const RECEIVER_HANDLE: u32 = 0;
const SENDER_HANDLE: u32 = 1;
const RECEIVER_CREDIT: u32 = 100;
const SESSION_WINDOW: u32 = 2048;
/// Room left in each transfer frame for the performative itself.
const TRANSFER_OVERHEAD: usize = 64;

/// Byte stream a connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Requests accepted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    /// Attach a receiver with a dynamic source.
    OpenReceiver,
    /// Attach a sender; `None` is the anonymous relay.
    OpenSender { address: Option<String> },
    /// Send a pre-settled message on the sender link.
    Send(Message),
    Close,
}

/// Notifications emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The peer attached the receiver and assigned it an address.
    ReceiverOpened { address: String },
    SenderOpened,
    /// The sender received credit.
    Sendable,
    Message(Message),
    /// Emitted exactly once. `None` when closed locally.
    Closed { reason: Option<String> },
}

/// What the peer announced in its open frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteOpen {
    pub container_id: String,
    pub properties: BTreeMap<String, Value>,
    pub max_frame_size: u32,
    pub idle_timeout: Option<u32>,
}

impl From<&Open> for RemoteOpen {
    fn from(open: &Open) -> Self {
        Self {
            container_id: open.container_id.clone(),
            properties: open.properties.clone(),
            max_frame_size: open.max_frame_size,
            idle_timeout: open.idle_timeout,
        }
    }
}

/// Cloneable command side of a connection.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl CommandSender {
    pub fn send(&self, command: ConnectionCommand) -> AmqpResult<()> {
        self.tx
            .send(command)
            .map_err(|_| AmqpError::closed("connection task has exited"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established connection. Dropping every command sender closes it.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub commands: CommandSender,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub remote: RemoteOpen,
}

/// The other end of an in-process connection.
#[derive(Debug)]
pub struct PeerEnd {
    pub commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// A handle wired to channels instead of a socket.
    pub fn pair(remote: RemoteOpen) -> (ConnectionHandle, PeerEnd) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                commands: CommandSender { tx: command_tx },
                events: event_rx,
                remote,
            },
            PeerEnd {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

/// Opens connections to a router.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> AmqpResult<ConnectionHandle>;
}

/// TCP connector with optional TLS.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, options: &ConnectOptions) -> AmqpResult<ConnectionHandle> {
        options.validate()?;
        let endpoint = options.endpoint();
        let tcp = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| AmqpError::connection_failed(format!("{endpoint}: {e}")))?;
        tcp.set_nodelay(true)?;

        let transport: BoxedTransport = if options.tls_enabled() {
            let connector = TlsConnector::from(tls::client_config(options)?);
            let stream = connector
                .connect(tls::server_name(options)?, tcp)
                .await
                .map_err(|e| AmqpError::tls(format!("handshake with {endpoint} failed: {e}")))?;
            Box::new(stream)
        } else {
            Box::new(tcp)
        };

        establish(transport, options).await
    }
}

type Framing = Framed<BoxedTransport, FrameCodec>;

/// Runs SASL and the open/begin exchange, then spawns the driver task.
pub async fn establish(transport: BoxedTransport, options: &ConnectOptions) -> AmqpResult<ConnectionHandle> {
    let mut framed = Framed::new(
        transport,
        FrameCodec::new().with_max_frame_size(options.max_frame_size),
    );

    let credentials = Credentials {
        username: options.username.clone(),
        password: options.resolve_password()?,
        has_client_certificate: options.ssl_certificate.is_some(),
        allowed: options.allowed_mechanisms(),
    };
    negotiate_sasl(&mut framed, &credentials, options.hostname.clone()).await?;

    framed.send(Wire::Header(ProtocolId::Amqp)).await?;
    match read_wire(&mut framed).await? {
        Wire::Header(ProtocolId::Amqp) => {}
        other => return Err(AmqpError::protocol(format!("expected AMQP header, got {other:?}"))),
    }

    let container_id = options
        .container_id
        .clone()
        .unwrap_or_else(|| format!("qdmetrics-{}", Uuid::new_v4()));
    let mut open = Open::new(container_id);
    open.hostname = Some(options.hostname.clone().unwrap_or_else(|| options.address.clone()));
    open.max_frame_size = options.max_frame_size;
    open.channel_max = 0;
    open.idle_timeout = (options.idle_timeout_ms > 0).then_some(options.idle_timeout_ms);
    open.properties = options
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    send_performative(&mut framed, Performative::Open(open)).await?;
    send_performative(
        &mut framed,
        Performative::Begin(Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: SESSION_WINDOW,
            outgoing_window: SESSION_WINDOW,
            handle_max: Some(SENDER_HANDLE),
        }),
    )
    .await?;

    let mut remote_open = None;
    let mut next_incoming_id = None;
    while remote_open.is_none() || next_incoming_id.is_none() {
        let (performative, _) = read_performative(&mut framed).await?;
        match performative {
            Performative::Open(o) => remote_open = Some(RemoteOpen::from(&o)),
            Performative::Begin(b) => next_incoming_id = Some(b.next_outgoing_id),
            Performative::Close(error) => {
                return Err(AmqpError::connection_failed(match error {
                    Some(e) => format!("peer refused connection: {e}"),
                    None => "peer refused connection".to_string(),
                }))
            }
            other => {
                return Err(AmqpError::protocol(format!(
                    "unexpected {} during open",
                    other.name()
                )))
            }
        }
    }
    let (Some(remote), Some(next_incoming_id)) = (remote_open, next_incoming_id) else {
        return Err(AmqpError::protocol("open handshake incomplete"));
    };

    let max_frame = options.max_frame_size.min(remote.max_frame_size).max(512) as usize;
    info!(container = %remote.container_id, max_frame, "connection opened");

    let heartbeat = remote
        .idle_timeout
        .filter(|t| *t > 0)
        .map(|t| Duration::from_millis(t as u64 / 2));
    let idle_limit = (options.idle_timeout_ms > 0)
        .then(|| Duration::from_millis(options.idle_timeout_ms as u64));

    let max_message = usize::try_from(options.max_message_size).unwrap_or(usize::MAX);

    let (handle, peer) = ConnectionHandle::pair(remote);
    let driver = Driver {
        framed,
        commands: peer.commands,
        events: peer.events,
        max_frame,
        max_message,
        heartbeat,
        idle_limit,
        last_received: Instant::now(),
        receiver: ReceiverLink::default(),
        sender: SenderLink::default(),
        next_outgoing_id: 0,
        next_incoming_id,
        next_delivery_id: 0,
        partial: None,
    };
    tokio::spawn(driver.run());
    Ok(handle)
}

async fn negotiate_sasl(
    framed: &mut Framing,
    credentials: &Credentials,
    hostname: Option<String>,
) -> AmqpResult<()> {
    framed.send(Wire::Header(ProtocolId::Sasl)).await?;
    match read_wire(framed).await? {
        Wire::Header(ProtocolId::Sasl) => {}
        Wire::Header(ProtocolId::Amqp) => {
            return Err(AmqpError::connection_failed("peer does not accept a SASL layer"))
        }
        Wire::Frame(_) => return Err(AmqpError::protocol("expected SASL header")),
    }

    let offered = match read_sasl(framed).await? {
        SaslFrame::Mechanisms(offered) => offered,
        other => return Err(AmqpError::protocol(format!("expected sasl-mechanisms, got {other:?}"))),
    };
    let mechanism = credentials.select(&offered)?;
    debug!(mechanism = mechanism.name(), "sasl mechanism selected");

    let init = SaslFrame::Init {
        mechanism: mechanism.name().to_string(),
        initial_response: mechanism.initial_response(),
        hostname,
    };
    framed.send(Wire::Frame(Frame::sasl(init.encode()))).await?;

    match read_sasl(framed).await? {
        SaslFrame::Outcome { code: 0, .. } => Ok(()),
        SaslFrame::Outcome { code, .. } => Err(AmqpError::sasl(format!(
            "{} authentication rejected with code {code}",
            mechanism.name()
        ))),
        other => Err(AmqpError::protocol(format!("expected sasl-outcome, got {other:?}"))),
    }
}

async fn read_wire(framed: &mut Framing) -> AmqpResult<Wire> {
    match framed.next().await {
        Some(Ok(wire)) => Ok(wire),
        Some(Err(e)) => Err(e.into()),
        None => Err(AmqpError::closed("connection closed during handshake")),
    }
}

async fn read_sasl(framed: &mut Framing) -> AmqpResult<SaslFrame> {
    match read_wire(framed).await? {
        Wire::Frame(frame) if frame.frame_type == FrameType::Sasl => SaslFrame::decode(&frame.body),
        other => Err(AmqpError::protocol(format!("expected SASL frame, got {other:?}"))),
    }
}

async fn read_performative(framed: &mut Framing) -> AmqpResult<(Performative, Bytes)> {
    loop {
        match read_wire(framed).await? {
            Wire::Frame(frame) if frame.is_heartbeat() => continue,
            Wire::Frame(frame) if frame.frame_type == FrameType::Amqp => {
                return Performative::decode(&frame.body)
            }
            other => return Err(AmqpError::protocol(format!("unexpected {other:?}"))),
        }
    }
}

async fn send_performative(framed: &mut Framing, performative: Performative) -> AmqpResult<()> {
    trace!(performative = performative.name(), "send");
    framed
        .send(Wire::Frame(Frame::amqp(0, performative.encode(None))))
        .await?;
    Ok(())
}

#[derive(Debug, Default)]
struct ReceiverLink {
    name: Option<String>,
    remote_handle: Option<u32>,
    delivery_count: u32,
    credit: u32,
}

#[derive(Debug, Default)]
struct SenderLink {
    name: Option<String>,
    remote_handle: Option<u32>,
    delivery_count: u32,
    credit: u32,
    pending: VecDeque<Message>,
}

struct Driver {
    framed: Framing,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    max_frame: usize,
    /// Limit on a message reassembled from `more` transfers.
    max_message: usize,
    heartbeat: Option<Duration>,
    idle_limit: Option<Duration>,
    last_received: Instant,
    receiver: ReceiverLink,
    sender: SenderLink,
    next_outgoing_id: u32,
    next_incoming_id: u32,
    next_delivery_id: u32,
    partial: Option<(Transfer, BytesMut)>,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let reason = match self.drive().await {
            Ok(()) => {
                debug!("connection closed");
                None
            }
            Err(e) => {
                warn!(error = %e, "connection dropped");
                Some(e.to_string())
            }
        };
        let _ = self.events.send(ConnectionEvent::Closed { reason });
    }

    fn tick_period(&self) -> Option<Duration> {
        let idle_check = self.idle_limit.map(|limit| limit / 2);
        match (self.heartbeat, idle_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
        .filter(|period| !period.is_zero())
    }

    async fn drive(&mut self) -> AmqpResult<()> {
        let mut ticker = self.tick_period().map(tokio::time::interval);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Close) | None => {
                        self.close_gracefully().await;
                        return Ok(());
                    }
                    Some(command) => self.on_command(command).await?,
                },
                wire = self.framed.next() => {
                    let frame = match wire {
                        Some(Ok(Wire::Frame(frame))) => frame,
                        Some(Ok(Wire::Header(_))) => {
                            return Err(AmqpError::protocol("unexpected protocol header"))
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(AmqpError::closed("connection closed by peer")),
                    };
                    self.last_received = Instant::now();
                    if frame.is_heartbeat() {
                        trace!("heartbeat received");
                        continue;
                    }
                    let (performative, payload) = Performative::decode(&frame.body)?;
                    trace!(performative = performative.name(), "received");
                    self.on_performative(performative, payload).await?;
                }
                _ = tick(&mut ticker) => self.on_tick().await?,
            }
        }
    }

    async fn send(&mut self, performative: Performative, payload: Option<&[u8]>) -> AmqpResult<()> {
        trace!(performative = performative.name(), "send");
        self.framed
            .send(Wire::Frame(Frame::amqp(0, performative.encode(payload))))
            .await?;
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    async fn on_command(&mut self, command: ConnectionCommand) -> AmqpResult<()> {
        match command {
            ConnectionCommand::OpenReceiver => {
                let name = format!("qdmetrics-receiver-{}", Uuid::new_v4());
                self.receiver.name = Some(name.clone());
                self.send(
                    Performative::Attach(Attach {
                        name,
                        handle: RECEIVER_HANDLE,
                        role: Role::Receiver,
                        snd_settle_mode: None,
                        source: Some(Terminus::dynamic()),
                        target: Some(Terminus::default()),
                        initial_delivery_count: None,
                    }),
                    None,
                )
                .await
            }
            ConnectionCommand::OpenSender { address } => {
                let name = format!("qdmetrics-sender-{}", Uuid::new_v4());
                self.sender.name = Some(name.clone());
                self.send(
                    Performative::Attach(Attach {
                        name,
                        handle: SENDER_HANDLE,
                        role: Role::Sender,
                        snd_settle_mode: Some(1),
                        source: Some(Terminus::default()),
                        target: Some(address.map(Terminus::address).unwrap_or_default()),
                        initial_delivery_count: Some(0),
                    }),
                    None,
                )
                .await
            }
            ConnectionCommand::Send(message) => {
                self.sender.pending.push_back(message);
                self.flush_pending().await
            }
            ConnectionCommand::Close => Ok(()),
        }
    }

    async fn flush_pending(&mut self) -> AmqpResult<()> {
        while self.sender.remote_handle.is_some() && self.sender.credit > 0 {
            let Some(message) = self.sender.pending.pop_front() else {
                break;
            };
            self.send_message(&message).await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, message: &Message) -> AmqpResult<()> {
        let payload = message.encode();
        let delivery_id = self.next_delivery_id;
        self.next_delivery_id = self.next_delivery_id.wrapping_add(1);

        let chunk = self.max_frame.saturating_sub(8 + TRANSFER_OVERHEAD).max(1);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload.as_ref()]
        } else {
            payload.chunks(chunk).collect()
        };
        let last = chunks.len() - 1;
        for (i, part) in chunks.into_iter().enumerate() {
            let first = i == 0;
            let transfer = Transfer {
                handle: SENDER_HANDLE,
                delivery_id: first.then_some(delivery_id),
                delivery_tag: first.then(|| Bytes::copy_from_slice(&delivery_id.to_be_bytes())),
                message_format: first.then_some(0),
                settled: Some(true),
                more: i != last,
            };
            self.send(Performative::Transfer(transfer), Some(part)).await?;
        }

        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.sender.delivery_count = self.sender.delivery_count.wrapping_add(1);
        self.sender.credit -= 1;
        Ok(())
    }

    async fn on_performative(&mut self, performative: Performative, payload: Bytes) -> AmqpResult<()> {
        match performative {
            Performative::Attach(attach) => self.on_attach(attach).await,
            Performative::Flow(flow) => self.on_flow(flow).await,
            Performative::Transfer(transfer) => self.on_transfer(transfer, payload).await,
            Performative::Disposition(_) => Ok(()),
            Performative::Detach(detach) => self.on_detach(detach).await,
            Performative::End(error) => Err(AmqpError::closed(match error {
                Some(e) => format!("session ended by peer: {e}"),
                None => "session ended by peer".to_string(),
            })),
            Performative::Close(error) => {
                let _ = self.send(Performative::Close(None), None).await;
                Err(AmqpError::closed(match error {
                    Some(e) => format!("closed by peer: {e}"),
                    None => "closed by peer".to_string(),
                }))
            }
            Performative::Open(_) | Performative::Begin(_) => Err(AmqpError::protocol(format!(
                "unexpected {} on open connection",
                performative.name()
            ))),
        }
    }

    async fn on_attach(&mut self, attach: Attach) -> AmqpResult<()> {
        if self.receiver.name.as_deref() == Some(attach.name.as_str()) {
            let address = attach
                .source
                .and_then(|source| source.address)
                .ok_or_else(|| AmqpError::protocol("receiver attach refused: no source address"))?;
            self.receiver.remote_handle = Some(attach.handle);
            self.receiver.delivery_count = attach.initial_delivery_count.unwrap_or(0);
            debug!(%address, "receiver attached");
            self.emit(ConnectionEvent::ReceiverOpened { address });
            self.grant_credit().await
        } else if self.sender.name.as_deref() == Some(attach.name.as_str()) {
            if attach.target.is_none() {
                return Err(AmqpError::protocol("sender attach refused: no target"));
            }
            self.sender.remote_handle = Some(attach.handle);
            debug!("sender attached");
            self.emit(ConnectionEvent::SenderOpened);
            Ok(())
        } else {
            Err(AmqpError::protocol(format!("attach for unknown link {}", attach.name)))
        }
    }

    async fn grant_credit(&mut self) -> AmqpResult<()> {
        self.receiver.credit = RECEIVER_CREDIT;
        let flow = Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: SESSION_WINDOW,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: SESSION_WINDOW,
            handle: Some(RECEIVER_HANDLE),
            delivery_count: Some(self.receiver.delivery_count),
            link_credit: Some(RECEIVER_CREDIT),
            drain: false,
            echo: false,
        };
        self.send(Performative::Flow(flow), None).await
    }

    async fn on_flow(&mut self, flow: Flow) -> AmqpResult<()> {
        if flow.handle.is_some() && flow.handle == self.sender.remote_handle {
            if let Some(link_credit) = flow.link_credit {
                let peer_count = flow.delivery_count.unwrap_or(self.sender.delivery_count);
                let had_credit = self.sender.credit > 0;
                self.sender.credit = peer_count
                    .wrapping_add(link_credit)
                    .wrapping_sub(self.sender.delivery_count);
                if self.sender.credit > link_credit {
                    self.sender.credit = 0;
                }
                if !had_credit && self.sender.credit > 0 {
                    self.emit(ConnectionEvent::Sendable);
                }
            }
            self.flush_pending().await?;
        }
        if flow.echo {
            let reply = Flow {
                next_incoming_id: Some(self.next_incoming_id),
                incoming_window: SESSION_WINDOW,
                next_outgoing_id: self.next_outgoing_id,
                outgoing_window: SESSION_WINDOW,
                ..Flow::default()
            };
            self.send(Performative::Flow(reply), None).await?;
        }
        Ok(())
    }

    async fn on_transfer(&mut self, transfer: Transfer, payload: Bytes) -> AmqpResult<()> {
        if Some(transfer.handle) != self.receiver.remote_handle {
            return Err(AmqpError::protocol(format!(
                "transfer on unknown handle {}",
                transfer.handle
            )));
        }

        let (first, mut buffer) = match self.partial.take() {
            Some((first, mut buffer)) => {
                buffer.extend_from_slice(&payload);
                (first, buffer)
            }
            None => (transfer.clone(), BytesMut::from(payload.as_ref())),
        };
        if buffer.len() > self.max_message {
            return Err(AmqpError::protocol(format!(
                "message exceeds {} bytes",
                self.max_message
            )));
        }
        if transfer.more {
            self.partial = Some((first, buffer));
            return Ok(());
        }

        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.receiver.delivery_count = self.receiver.delivery_count.wrapping_add(1);
        self.receiver.credit = self.receiver.credit.saturating_sub(1);

        match Message::decode(&buffer.split()) {
            Ok(message) => self.emit(ConnectionEvent::Message(message)),
            Err(e) => warn!(error = %e, "dropping undecodable message"),
        }

        let settled = first.settled.unwrap_or(false) || transfer.settled.unwrap_or(false);
        if !settled {
            if let Some(delivery_id) = first.delivery_id {
                self.send(
                    Performative::Disposition(Disposition::accept(Role::Receiver, delivery_id)),
                    None,
                )
                .await?;
            }
        }

        if self.receiver.credit <= RECEIVER_CREDIT / 2 {
            self.grant_credit().await?;
        }
        Ok(())
    }

    async fn on_detach(&mut self, detach: Detach) -> AmqpResult<()> {
        let link = if Some(detach.handle) == self.receiver.remote_handle {
            Some(RECEIVER_HANDLE)
        } else if Some(detach.handle) == self.sender.remote_handle {
            Some(SENDER_HANDLE)
        } else {
            None
        };
        if let Some(handle) = link {
            let _ = self
                .send(
                    Performative::Detach(Detach {
                        handle,
                        closed: true,
                        error: None,
                    }),
                    None,
                )
                .await;
        }
        Err(AmqpError::closed(match detach.error {
            Some(e) => format!("link detached by peer: {e}"),
            None => "link detached by peer".to_string(),
        }))
    }

    async fn on_tick(&mut self) -> AmqpResult<()> {
        if let Some(limit) = self.idle_limit {
            if self.last_received.elapsed() > limit {
                return Err(AmqpError::closed("idle timeout expired"));
            }
        }
        if self.heartbeat.is_some() {
            self.framed.send(Wire::Frame(Frame::heartbeat())).await?;
        }
        Ok(())
    }

    async fn close_gracefully(&mut self) {
        if self.receiver.remote_handle.is_some() {
            let _ = self
                .send(
                    Performative::Detach(Detach {
                        handle: RECEIVER_HANDLE,
                        closed: true,
                        error: None,
                    }),
                    None,
                )
                .await;
        }
        if self.sender.remote_handle.is_some() {
            let _ = self
                .send(
                    Performative::Detach(Detach {
                        handle: SENDER_HANDLE,
                        closed: true,
                        error: None,
                    }),
                    None,
                )
                .await;
        }
        let _ = self.send(Performative::End(None), None).await;
        let _ = self.send(Performative::Close(None), None).await;
    }
}
