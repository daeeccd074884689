//! Message sections: properties, application properties and an amqp-value body.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::codec::{self, Reader};
use crate::performative::Fields;
use crate::{AmqpError, AmqpResult, Value};

mod section {
    pub const HEADER: u64 = 0x70;
    pub const DELIVERY_ANNOTATIONS: u64 = 0x71;
    pub const MESSAGE_ANNOTATIONS: u64 = 0x72;
    pub const PROPERTIES: u64 = 0x73;
    pub const APPLICATION_PROPERTIES: u64 = 0x74;
    pub const DATA: u64 = 0x75;
    pub const AMQP_SEQUENCE: u64 = 0x76;
    pub const AMQP_VALUE: u64 = 0x77;
    pub const FOOTER: u64 = 0x78;
}

/// The properties section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub message_id: Option<Value>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<Value>,
    pub content_type: Option<String>,
}

impl Properties {
    fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    fn to_value(&self) -> Value {
        let text = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);
        let mut fields = vec![
            self.message_id.clone().unwrap_or(Value::Null),
            self.user_id.clone().map(Value::Binary).unwrap_or(Value::Null),
            text(&self.to),
            text(&self.subject),
            text(&self.reply_to),
            self.correlation_id.clone().unwrap_or(Value::Null),
            self.content_type
                .clone()
                .map(Value::Symbol)
                .unwrap_or(Value::Null),
        ];
        while matches!(fields.last(), Some(Value::Null)) {
            fields.pop();
        }
        Value::described(section::PROPERTIES, Value::List(fields))
    }

    fn from_value(value: Value) -> AmqpResult<Self> {
        let mut fields = Fields::from_described(value, section::PROPERTIES, "properties")?;
        Ok(Self {
            message_id: fields.take(0),
            user_id: match fields.take(1) {
                Some(Value::Binary(b)) => Some(b),
                _ => None,
            },
            to: fields.opt_string(2),
            subject: fields.opt_string(3),
            reply_to: fields.opt_string(4),
            correlation_id: fields.take(5),
            content_type: fields.opt_string(6),
        })
    }
}

/// A message as exchanged with a management node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub properties: Properties,
    pub application_properties: BTreeMap<String, Value>,
    pub body: Option<Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.properties.to = Some(to.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<Value>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_application_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn application_property(&self, key: &str) -> Option<&Value> {
        self.application_properties.get(key)
    }

    pub fn correlation_id(&self) -> Option<&Value> {
        self.properties.correlation_id.as_ref()
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        if !self.properties.is_empty() {
            codec::encode(&self.properties.to_value(), &mut dst);
        }
        if !self.application_properties.is_empty() {
            let map = Value::string_map(
                self.application_properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            codec::encode(&Value::described(section::APPLICATION_PROPERTIES, map), &mut dst);
        }
        if let Some(body) = &self.body {
            codec::encode(&Value::described(section::AMQP_VALUE, body.clone()), &mut dst);
        }
        dst.freeze()
    }

    /// Decodes a message. Sections this client has no use for are skipped.
    pub fn decode(data: &[u8]) -> AmqpResult<Self> {
        let mut reader = Reader::new(data);
        let mut message = Message::default();
        while !reader.is_empty() {
            let value = reader.read_value()?;
            let code = value
                .descriptor_code()
                .ok_or_else(|| AmqpError::decode(format!("message section is not described: {value}")))?;
            match code {
                section::PROPERTIES => message.properties = Properties::from_value(value)?,
                section::APPLICATION_PROPERTIES => {
                    if let Value::Described(_, body) = value {
                        if let Value::Map(entries) = *body {
                            for (k, v) in entries {
                                if let Some(key) = k.as_str() {
                                    message.application_properties.insert(key.to_string(), v);
                                }
                            }
                        }
                    }
                }
                section::AMQP_VALUE => {
                    if let Value::Described(_, body) = value {
                        message.body = Some(*body);
                    }
                }
                section::DATA => {
                    if message.body.is_none() {
                        if let Value::Described(_, body) = value {
                            message.body = Some(*body);
                        }
                    }
                }
                section::HEADER
                | section::DELIVERY_ANNOTATIONS
                | section::MESSAGE_ANNOTATIONS
                | section::AMQP_SEQUENCE
                | section::FOOTER => {}
                other => {
                    return Err(AmqpError::decode(format!("unknown message section {other:#x}")))
                }
            }
        }
        Ok(message)
    }
}
