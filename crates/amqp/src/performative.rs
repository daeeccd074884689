//! Connection, session and link performatives.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::codec::{self, Reader};
use crate::{AmqpError, AmqpResult, Value};

pub mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const ACCEPTED: u64 = 0x24;
    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;
}

/// Positional fields of a described list, with AMQP's null-means-absent rule.
pub(crate) struct Fields(Vec<Value>);

impl Fields {
    pub(crate) fn from_described(value: Value, expected: u64, name: &str) -> AmqpResult<Self> {
        match value {
            Value::Described(d, body) if d.as_u64() == Some(expected) => match *body {
                Value::List(items) => Ok(Fields(items)),
                other => Err(AmqpError::decode(format!("{name} body is not a list: {other}"))),
            },
            other => Err(AmqpError::decode(format!("expected {name}, got {other}"))),
        }
    }

    pub(crate) fn get(&self, i: usize) -> Option<&Value> {
        self.0.get(i).filter(|v| !v.is_null())
    }

    pub(crate) fn take(&mut self, i: usize) -> Option<Value> {
        self.0
            .get_mut(i)
            .map(|v| std::mem::replace(v, Value::Null))
            .filter(|v| !v.is_null())
    }

    pub(crate) fn opt_u32(&self, i: usize) -> AmqpResult<Option<u32>> {
        self.get(i)
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| AmqpError::decode(format!("field {i} is not a uint: {v}")))
            })
            .transpose()
    }

    pub(crate) fn u32(&self, i: usize, name: &str) -> AmqpResult<u32> {
        self.opt_u32(i)?
            .ok_or_else(|| AmqpError::decode(format!("missing mandatory field {name}")))
    }

    pub(crate) fn opt_string(&self, i: usize) -> Option<String> {
        self.get(i).and_then(Value::as_str).map(str::to_string)
    }

    pub(crate) fn bool_or(&self, i: usize, default: bool) -> bool {
        self.get(i).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Builds a described list, dropping trailing nulls.
fn described_list(code: u64, mut fields: Vec<Value>) -> Value {
    while matches!(fields.last(), Some(Value::Null)) {
        fields.pop();
    }
    Value::described(code, Value::List(fields))
}

fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

/// Link role. On the wire `false` is sender and `true` is receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    fn to_value(self) -> Value {
        Value::Bool(self == Role::Receiver)
    }

    fn from_bool(receiver: bool) -> Self {
        if receiver {
            Role::Receiver
        } else {
            Role::Sender
        }
    }
}

/// Error condition carried by detach, end and close.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>, description: Option<String>) -> Self {
        Self {
            condition: condition.into(),
            description,
        }
    }

    fn to_value(&self) -> Value {
        described_list(
            descriptor::ERROR,
            vec![
                Value::symbol(self.condition.clone()),
                opt(self.description.clone()),
            ],
        )
    }

    fn from_value(value: Value) -> AmqpResult<Self> {
        let fields = Fields::from_described(value, descriptor::ERROR, "error")?;
        Ok(Self {
            condition: fields.opt_string(0).unwrap_or_default(),
            description: fields.opt_string(1),
        })
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {}", self.condition, d),
            None => f.write_str(&self.condition),
        }
    }
}

fn opt_error(fields: &mut Fields, i: usize) -> AmqpResult<Option<ErrorCondition>> {
    fields.take(i).map(ErrorCondition::from_value).transpose()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    pub idle_timeout: Option<u32>,
    pub properties: BTreeMap<String, Value>,
}

impl Open {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_timeout: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Option<u32>,
}

/// Source or target terminus. Only the fields a management client uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Terminus {
    pub address: Option<String>,
    pub dynamic: bool,
}

impl Terminus {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            dynamic: false,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            address: None,
            dynamic: true,
        }
    }

    fn to_value(&self, code: u64) -> Value {
        described_list(
            code,
            vec![
                opt(self.address.clone()),
                Value::Null,
                Value::Null,
                Value::Null,
                if self.dynamic { Value::Bool(true) } else { Value::Null },
            ],
        )
    }

    fn from_value(value: Value, code: u64) -> AmqpResult<Self> {
        let fields = Fields::from_described(value, code, "terminus")?;
        Ok(Self {
            address: fields.opt_string(0),
            dynamic: fields.bool_or(4, false),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    /// 1 = settled, the only mode this client sends with.
    pub snd_settle_mode: Option<u8>,
    pub source: Option<Terminus>,
    pub target: Option<Terminus>,
    pub initial_delivery_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub drain: bool,
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<Value>,
}

impl Disposition {
    /// Settles one delivery as accepted.
    pub fn accept(role: Role, delivery_id: u32) -> Self {
        Self {
            role,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(Value::described(descriptor::ACCEPTED, Value::List(Vec::new()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(Option<ErrorCondition>),
    Close(Option<ErrorCondition>),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(o) => {
                let properties = if o.properties.is_empty() {
                    Value::Null
                } else {
                    Value::Map(
                        o.properties
                            .iter()
                            .map(|(k, v)| (Value::symbol(k.clone()), v.clone()))
                            .collect(),
                    )
                };
                described_list(
                    descriptor::OPEN,
                    vec![
                        Value::String(o.container_id.clone()),
                        opt(o.hostname.clone()),
                        Value::Uint(o.max_frame_size),
                        Value::Ushort(o.channel_max),
                        opt(o.idle_timeout),
                        Value::Null,
                        Value::Null,
                        Value::Null,
                        Value::Null,
                        properties,
                    ],
                )
            }
            Performative::Begin(b) => described_list(
                descriptor::BEGIN,
                vec![
                    b.remote_channel.map(Value::Ushort).unwrap_or(Value::Null),
                    Value::Uint(b.next_outgoing_id),
                    Value::Uint(b.incoming_window),
                    Value::Uint(b.outgoing_window),
                    opt(b.handle_max),
                ],
            ),
            Performative::Attach(a) => described_list(
                descriptor::ATTACH,
                vec![
                    Value::String(a.name.clone()),
                    Value::Uint(a.handle),
                    a.role.to_value(),
                    a.snd_settle_mode.map(Value::Ubyte).unwrap_or(Value::Null),
                    Value::Null,
                    a.source
                        .as_ref()
                        .map(|s| s.to_value(descriptor::SOURCE))
                        .unwrap_or(Value::Null),
                    a.target
                        .as_ref()
                        .map(|t| t.to_value(descriptor::TARGET))
                        .unwrap_or(Value::Null),
                    Value::Null,
                    Value::Null,
                    opt(a.initial_delivery_count),
                ],
            ),
            Performative::Flow(f) => described_list(
                descriptor::FLOW,
                vec![
                    opt(f.next_incoming_id),
                    Value::Uint(f.incoming_window),
                    Value::Uint(f.next_outgoing_id),
                    Value::Uint(f.outgoing_window),
                    opt(f.handle),
                    opt(f.delivery_count),
                    opt(f.link_credit),
                    Value::Null,
                    Value::Bool(f.drain),
                    Value::Bool(f.echo),
                ],
            ),
            Performative::Transfer(t) => described_list(
                descriptor::TRANSFER,
                vec![
                    Value::Uint(t.handle),
                    opt(t.delivery_id),
                    t.delivery_tag.clone().map(Value::Binary).unwrap_or(Value::Null),
                    opt(t.message_format),
                    opt(t.settled),
                    if t.more { Value::Bool(true) } else { Value::Null },
                ],
            ),
            Performative::Disposition(d) => described_list(
                descriptor::DISPOSITION,
                vec![
                    d.role.to_value(),
                    Value::Uint(d.first),
                    opt(d.last),
                    Value::Bool(d.settled),
                    d.state.clone().unwrap_or(Value::Null),
                ],
            ),
            Performative::Detach(d) => described_list(
                descriptor::DETACH,
                vec![
                    Value::Uint(d.handle),
                    Value::Bool(d.closed),
                    d.error.as_ref().map(ErrorCondition::to_value).unwrap_or(Value::Null),
                ],
            ),
            Performative::End(e) => described_list(
                descriptor::END,
                vec![e.as_ref().map(ErrorCondition::to_value).unwrap_or(Value::Null)],
            ),
            Performative::Close(e) => described_list(
                descriptor::CLOSE,
                vec![e.as_ref().map(ErrorCondition::to_value).unwrap_or(Value::Null)],
            ),
        }
    }

    pub fn from_value(value: Value) -> AmqpResult<Self> {
        let code = value
            .descriptor_code()
            .ok_or_else(|| AmqpError::decode(format!("performative is not described: {value}")))?;
        let performative = match code {
            descriptor::OPEN => {
                let fields = Fields::from_described(value, code, "open")?;
                let properties = fields
                    .get(9)
                    .and_then(Value::as_map)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                            .collect()
                    })
                    .unwrap_or_default();
                Performative::Open(Open {
                    container_id: fields.opt_string(0).unwrap_or_default(),
                    hostname: fields.opt_string(1),
                    max_frame_size: fields.opt_u32(2)?.unwrap_or(u32::MAX),
                    channel_max: fields
                        .get(3)
                        .and_then(Value::as_u64)
                        .map(|v| v.min(u16::MAX as u64) as u16)
                        .unwrap_or(u16::MAX),
                    idle_timeout: fields.opt_u32(4)?,
                    properties,
                })
            }
            descriptor::BEGIN => {
                let fields = Fields::from_described(value, code, "begin")?;
                Performative::Begin(Begin {
                    remote_channel: fields.get(0).and_then(Value::as_u64).map(|v| v as u16),
                    next_outgoing_id: fields.u32(1, "next-outgoing-id")?,
                    incoming_window: fields.u32(2, "incoming-window")?,
                    outgoing_window: fields.u32(3, "outgoing-window")?,
                    handle_max: fields.opt_u32(4)?,
                })
            }
            descriptor::ATTACH => {
                let mut fields = Fields::from_described(value, code, "attach")?;
                let source = fields
                    .take(5)
                    .map(|v| Terminus::from_value(v, descriptor::SOURCE))
                    .transpose()?;
                let target = fields
                    .take(6)
                    .map(|v| Terminus::from_value(v, descriptor::TARGET))
                    .transpose()?;
                Performative::Attach(Attach {
                    name: fields.opt_string(0).unwrap_or_default(),
                    handle: fields.u32(1, "handle")?,
                    role: Role::from_bool(fields.bool_or(2, false)),
                    snd_settle_mode: fields.get(3).and_then(Value::as_u64).map(|v| v as u8),
                    source,
                    target,
                    initial_delivery_count: fields.opt_u32(9)?,
                })
            }
            descriptor::FLOW => {
                let fields = Fields::from_described(value, code, "flow")?;
                Performative::Flow(Flow {
                    next_incoming_id: fields.opt_u32(0)?,
                    incoming_window: fields.u32(1, "incoming-window")?,
                    next_outgoing_id: fields.u32(2, "next-outgoing-id")?,
                    outgoing_window: fields.u32(3, "outgoing-window")?,
                    handle: fields.opt_u32(4)?,
                    delivery_count: fields.opt_u32(5)?,
                    link_credit: fields.opt_u32(6)?,
                    drain: fields.bool_or(8, false),
                    echo: fields.bool_or(9, false),
                })
            }
            descriptor::TRANSFER => {
                let fields = Fields::from_described(value, code, "transfer")?;
                Performative::Transfer(Transfer {
                    handle: fields.u32(0, "handle")?,
                    delivery_id: fields.opt_u32(1)?,
                    delivery_tag: match fields.get(2) {
                        Some(Value::Binary(b)) => Some(b.clone()),
                        _ => None,
                    },
                    message_format: fields.opt_u32(3)?,
                    settled: fields.get(4).and_then(Value::as_bool),
                    more: fields.bool_or(5, false),
                })
            }
            descriptor::DISPOSITION => {
                let mut fields = Fields::from_described(value, code, "disposition")?;
                Performative::Disposition(Disposition {
                    role: Role::from_bool(fields.bool_or(0, false)),
                    first: fields.u32(1, "first")?,
                    last: fields.opt_u32(2)?,
                    settled: fields.bool_or(3, false),
                    state: fields.take(4),
                })
            }
            descriptor::DETACH => {
                let mut fields = Fields::from_described(value, code, "detach")?;
                Performative::Detach(Detach {
                    handle: fields.u32(0, "handle")?,
                    closed: fields.bool_or(1, false),
                    error: opt_error(&mut fields, 2)?,
                })
            }
            descriptor::END => {
                let mut fields = Fields::from_described(value, code, "end")?;
                Performative::End(opt_error(&mut fields, 0)?)
            }
            descriptor::CLOSE => {
                let mut fields = Fields::from_described(value, code, "close")?;
                Performative::Close(opt_error(&mut fields, 0)?)
            }
            other => {
                return Err(AmqpError::protocol(format!(
                    "unexpected performative descriptor {other:#x}"
                )))
            }
        };
        Ok(performative)
    }

    /// Encodes the performative followed by an optional transfer payload.
    pub fn encode(&self, payload: Option<&[u8]>) -> Bytes {
        let mut dst = BytesMut::new();
        codec::encode(&self.to_value(), &mut dst);
        if let Some(payload) = payload {
            dst.extend_from_slice(payload);
        }
        dst.freeze()
    }

    /// Decodes a frame body into the performative and the bytes after it.
    pub fn decode(body: &Bytes) -> AmqpResult<(Self, Bytes)> {
        let mut reader = Reader::new(body);
        let value = reader.read_value()?;
        let payload = body.slice(reader.position()..);
        Ok((Self::from_value(value)?, payload))
    }
}
