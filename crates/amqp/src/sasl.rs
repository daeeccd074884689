//! SASL negotiation frames and mechanism selection.

use bytes::Bytes;

use crate::codec::{self, Reader};
use crate::performative::Fields;
use crate::{AmqpError, AmqpResult, Value};

const SASL_MECHANISMS: u64 = 0x40;
const SASL_INIT: u64 = 0x41;
const SASL_OUTCOME: u64 = 0x44;

#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrame {
    Mechanisms(Vec<String>),
    Init {
        mechanism: String,
        initial_response: Option<Bytes>,
        hostname: Option<String>,
    },
    Outcome {
        code: u8,
        additional_data: Option<Bytes>,
    },
}

impl SaslFrame {
    pub fn to_value(&self) -> Value {
        match self {
            SaslFrame::Mechanisms(mechanisms) => Value::described(
                SASL_MECHANISMS,
                Value::List(vec![Value::Array(
                    mechanisms.iter().cloned().map(Value::Symbol).collect(),
                )]),
            ),
            SaslFrame::Init {
                mechanism,
                initial_response,
                hostname,
            } => Value::described(
                SASL_INIT,
                Value::List(vec![
                    Value::symbol(mechanism.clone()),
                    initial_response
                        .clone()
                        .map(Value::Binary)
                        .unwrap_or(Value::Null),
                    hostname.clone().map(Value::String).unwrap_or(Value::Null),
                ]),
            ),
            SaslFrame::Outcome {
                code,
                additional_data,
            } => Value::described(
                SASL_OUTCOME,
                Value::List(vec![
                    Value::Ubyte(*code),
                    additional_data
                        .clone()
                        .map(Value::Binary)
                        .unwrap_or(Value::Null),
                ]),
            ),
        }
    }

    pub fn encode(&self) -> Bytes {
        codec::to_bytes(&self.to_value())
    }

    pub fn decode(body: &[u8]) -> AmqpResult<Self> {
        let value = Reader::new(body).read_value()?;
        match value.descriptor_code() {
            Some(SASL_MECHANISMS) => {
                let fields = Fields::from_described(value, SASL_MECHANISMS, "sasl-mechanisms")?;
                let mechanisms = match fields.get(0) {
                    Some(Value::Array(items)) | Some(Value::List(items)) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    Some(single) => single.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
                    None => Vec::new(),
                };
                Ok(SaslFrame::Mechanisms(mechanisms))
            }
            Some(SASL_INIT) => {
                let mut fields = Fields::from_described(value, SASL_INIT, "sasl-init")?;
                Ok(SaslFrame::Init {
                    mechanism: fields.opt_string(0).unwrap_or_default(),
                    initial_response: match fields.take(1) {
                        Some(Value::Binary(b)) => Some(b),
                        _ => None,
                    },
                    hostname: fields.opt_string(2),
                })
            }
            Some(SASL_OUTCOME) => {
                let mut fields = Fields::from_described(value, SASL_OUTCOME, "sasl-outcome")?;
                let code = fields
                    .get(0)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| AmqpError::decode("sasl-outcome without code"))?;
                Ok(SaslFrame::Outcome {
                    code: code as u8,
                    additional_data: match fields.take(1) {
                        Some(Value::Binary(b)) => Some(b),
                        _ => None,
                    },
                })
            }
            _ => Err(AmqpError::protocol(format!("unsupported sasl frame {value}"))),
        }
    }
}

/// Mechanism chosen for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    Anonymous,
    Plain { username: String, password: String },
    External,
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Anonymous => "ANONYMOUS",
            Mechanism::Plain { .. } => "PLAIN",
            Mechanism::External => "EXTERNAL",
        }
    }

    pub fn initial_response(&self) -> Option<Bytes> {
        match self {
            Mechanism::Anonymous => Some(Bytes::from_static(b"anonymous")),
            Mechanism::Plain { username, password } => {
                let mut response = Vec::with_capacity(username.len() + password.len() + 2);
                response.push(0);
                response.extend_from_slice(username.as_bytes());
                response.push(0);
                response.extend_from_slice(password.as_bytes());
                Some(Bytes::from(response))
            }
            Mechanism::External => Some(Bytes::new()),
        }
    }
}

/// What the client is able to authenticate with.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub has_client_certificate: bool,
    /// Upper-case allow-list; empty allows every mechanism.
    pub allowed: Vec<String>,
}

impl Credentials {
    /// Picks the strongest mechanism both sides support.
    pub fn select(&self, offered: &[String]) -> AmqpResult<Mechanism> {
        let usable = |name: &str| {
            offered.iter().any(|m| m.eq_ignore_ascii_case(name))
                && (self.allowed.is_empty() || self.allowed.iter().any(|a| a == name))
        };

        if self.has_client_certificate && usable("EXTERNAL") {
            return Ok(Mechanism::External);
        }
        if let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) {
            if usable("PLAIN") {
                return Ok(Mechanism::Plain {
                    username: username.clone(),
                    password: self.password.clone().unwrap_or_default(),
                });
            }
        }
        if usable("ANONYMOUS") {
            return Ok(Mechanism::Anonymous);
        }
        Err(AmqpError::sasl(format!(
            "no acceptable mechanism among [{}]",
            offered.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_preferred_with_username() {
        let credentials = Credentials {
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..Credentials::default()
        };
        let mechanism = credentials.select(&offered(&["ANONYMOUS", "PLAIN"])).unwrap();
        assert_eq!(mechanism.name(), "PLAIN");
        assert_eq!(
            mechanism.initial_response().unwrap().as_ref(),
            b"\0admin\0secret"
        );
    }

    #[test]
    fn test_anonymous_without_username() {
        let mechanism = Credentials::default()
            .select(&offered(&["PLAIN", "ANONYMOUS"]))
            .unwrap();
        assert_eq!(mechanism, Mechanism::Anonymous);
    }

    #[test]
    fn test_allow_list_restricts_choice() {
        let credentials = Credentials {
            username: Some("admin".to_string()),
            allowed: vec!["ANONYMOUS".to_string()],
            ..Credentials::default()
        };
        let mechanism = credentials.select(&offered(&["PLAIN", "ANONYMOUS"])).unwrap();
        assert_eq!(mechanism, Mechanism::Anonymous);

        let strict = Credentials {
            allowed: vec!["EXTERNAL".to_string()],
            ..Credentials::default()
        };
        assert!(strict.select(&offered(&["PLAIN", "ANONYMOUS"])).is_err());
    }

    #[test]
    fn test_external_with_certificate() {
        let credentials = Credentials {
            has_client_certificate: true,
            ..Credentials::default()
        };
        let mechanism = credentials
            .select(&offered(&["EXTERNAL", "ANONYMOUS"]))
            .unwrap();
        assert_eq!(mechanism, Mechanism::External);
    }

    #[test]
    fn test_frames_roundtrip() {
        let frames = [
            SaslFrame::Mechanisms(offered(&["PLAIN", "ANONYMOUS"])),
            SaslFrame::Init {
                mechanism: "PLAIN".to_string(),
                initial_response: Some(Bytes::from_static(b"\0u\0p")),
                hostname: None,
            },
            SaslFrame::Outcome {
                code: 0,
                additional_data: None,
            },
        ];
        for frame in frames {
            assert_eq!(SaslFrame::decode(&frame.encode()).unwrap(), frame);
        }
    }
}
