//! Management requests, replies and tabular query results.

use std::collections::BTreeMap;
use std::fmt;

use qdmetrics_amqp::{Message, Value};

use crate::{ManagementError, ManagementResult};

/// `type` application property of every management request.
pub const MANAGEMENT_TYPE: &str = "org.amqp.management";
/// Address of the management node on the connected router.
pub const MANAGEMENT_NODE: &str = "/$management";

/// Attribute that identifies an entity instance.
pub const NAME_ATTRIBUTE: &str = "name";

/// Management operations this client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementOperation {
    GetSchema,
    GetMgmtNodes,
    Query,
}

impl ManagementOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementOperation::GetSchema => "GET-SCHEMA",
            ManagementOperation::GetMgmtNodes => "GET-MGMT-NODES",
            ManagementOperation::Query => "QUERY",
        }
    }
}

impl fmt::Display for ManagementOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request before it is bound to a reply address and correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementRequest {
    pub operation: ManagementOperation,
    pub to: String,
    pub entity_type: Option<String>,
    pub body: Value,
}

impl ManagementRequest {
    /// Node-level operation against the connected router.
    pub fn node(operation: ManagementOperation) -> Self {
        Self {
            operation,
            to: MANAGEMENT_NODE.to_string(),
            entity_type: None,
            body: Value::List(Vec::new()),
        }
    }

    /// QUERY of `attribute_names` on every instance of `entity_type` at `to`.
    pub fn query(to: impl Into<String>, entity_type: impl Into<String>, attribute_names: &[String]) -> Self {
        let names = attribute_names
            .iter()
            .map(|name| Value::String(name.clone()))
            .collect();
        Self {
            operation: ManagementOperation::Query,
            to: to.into(),
            entity_type: Some(entity_type.into()),
            body: Value::string_map([("attributeNames", Value::List(names))]),
        }
    }

    pub fn into_message(self, reply_to: &str, correlation_id: u64) -> Message {
        let mut message = Message::new()
            .with_to(self.to)
            .with_reply_to(reply_to)
            .with_correlation_id(Value::Ulong(correlation_id))
            .with_application_property("operation", self.operation.as_str())
            .with_application_property("type", MANAGEMENT_TYPE)
            .with_application_property("name", "self")
            .with_body(self.body);
        if let Some(entity_type) = self.entity_type {
            message = message.with_application_property("entityType", entity_type);
        }
        message
    }
}

/// A successful management reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementReply {
    pub status_code: u16,
    pub status_description: Option<String>,
    pub body: Value,
}

impl ManagementReply {
    /// Interprets a reply message. Status codes outside 2xx become errors.
    pub fn from_message(message: Message) -> ManagementResult<Self> {
        let status_code = match message.application_property("statusCode") {
            Some(value) => value
                .as_u64()
                .and_then(|code| u16::try_from(code).ok())
                .ok_or_else(|| ManagementError::protocol(format!("bad statusCode {value}")))?,
            None => 200,
        };
        let status_description = message
            .application_property("statusDescription")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !(200..=299).contains(&status_code) {
            return Err(ManagementError::Remote {
                status_code,
                description: status_description.unwrap_or_default(),
            });
        }

        Ok(Self {
            status_code,
            status_description,
            body: message.body.unwrap_or(Value::Null),
        })
    }
}

/// One entity instance, keyed by attribute name.
pub type Record = BTreeMap<String, Value>;

/// Pairs attribute names with a positional row. Names past the end of the row are left out.
pub fn flatten(attribute_names: &[String], row: &[Value]) -> Record {
    attribute_names
        .iter()
        .zip(row.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// The attribute list sent for a stat group: the configured names plus `name`, exactly once.
pub fn with_name_attribute(attributes: &[String]) -> Vec<String> {
    let mut names = attributes.to_vec();
    if !names.iter().any(|a| a == NAME_ATTRIBUTE) {
        names.push(NAME_ATTRIBUTE.to_string());
    }
    names
}

/// A QUERY reply: attribute names and positional rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQueryResult {
    pub attribute_names: Vec<String>,
    pub results: Vec<Vec<Value>>,
}

impl RawQueryResult {
    pub fn new(attribute_names: Vec<String>, results: Vec<Vec<Value>>) -> Self {
        Self {
            attribute_names,
            results,
        }
    }

    /// Parses the `{attributeNames, results}` body of a QUERY reply.
    pub fn from_reply(reply: &ManagementReply) -> ManagementResult<Self> {
        let body = &reply.body;
        let attribute_names = body
            .get("attributeNames")
            .and_then(Value::as_list)
            .ok_or_else(|| ManagementError::protocol("QUERY reply without attributeNames"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ManagementError::protocol(format!("attribute name is not a string: {v}")))
            })
            .collect::<ManagementResult<Vec<_>>>()?;

        let results = match body.get("results") {
            Some(rows) => rows
                .as_list()
                .ok_or_else(|| ManagementError::protocol("QUERY results is not a list"))?
                .iter()
                .map(|row| {
                    row.as_list()
                        .map(<[Value]>::to_vec)
                        .ok_or_else(|| ManagementError::protocol(format!("QUERY row is not a list: {row}")))
                })
                .collect::<ManagementResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            attribute_names,
            results,
        })
    }

    /// Flattens every row.
    pub fn records(&self) -> Vec<Record> {
        self.results
            .iter()
            .map(|row| flatten(&self.attribute_names, row))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flatten_pairs_names_and_values() {
        let attrs = names(&["name", "deliveries"]);
        let row = vec![Value::from("r1"), Value::Ulong(42)];

        let first = flatten(&attrs, &row);
        assert_eq!(first.get("name"), Some(&Value::from("r1")));
        assert_eq!(first.get("deliveries"), Some(&Value::Ulong(42)));
        assert_eq!(first.len(), 2);

        let second = flatten(&attrs, &row);
        assert_eq!(first, second);
    }

    #[test]
    fn test_flatten_short_row() {
        let record = flatten(&names(&["name", "deliveries"]), &[Value::from("r1")]);
        assert_eq!(record.len(), 1);
        assert!(!record.contains_key("deliveries"));
    }

    #[test]
    fn test_name_attribute_added_once() {
        assert_eq!(
            with_name_attribute(&names(&["deliveriesIngress"])),
            names(&["deliveriesIngress", "name"])
        );
        assert_eq!(
            with_name_attribute(&names(&["name", "deliveriesIngress"])),
            names(&["name", "deliveriesIngress"])
        );
    }

    #[test]
    fn test_query_message_shape() {
        let message = ManagementRequest::query(
            "_topo/0/R1/$management",
            "org.apache.qpid.dispatch.router",
            &names(&["name"]),
        )
        .into_message("amqp:/_topo/0/R1/temp.1", 9);

        assert_eq!(message.properties.to.as_deref(), Some("_topo/0/R1/$management"));
        assert_eq!(message.properties.reply_to.as_deref(), Some("amqp:/_topo/0/R1/temp.1"));
        assert_eq!(message.correlation_id(), Some(&Value::Ulong(9)));
        assert_eq!(
            message.application_property("operation").and_then(Value::as_str),
            Some("QUERY")
        );
        assert_eq!(
            message.application_property("type").and_then(Value::as_str),
            Some(MANAGEMENT_TYPE)
        );
        assert_eq!(
            message.application_property("name").and_then(Value::as_str),
            Some("self")
        );
        assert_eq!(
            message.application_property("entityType").and_then(Value::as_str),
            Some("org.apache.qpid.dispatch.router")
        );
        let requested = message
            .body
            .as_ref()
            .and_then(|b| b.get("attributeNames"))
            .and_then(Value::as_list)
            .map(<[Value]>::len);
        assert_eq!(requested, Some(1));
    }

    #[test]
    fn test_node_request_has_no_entity_type() {
        let message = ManagementRequest::node(ManagementOperation::GetMgmtNodes).into_message("r", 1);
        assert_eq!(message.properties.to.as_deref(), Some(MANAGEMENT_NODE));
        assert!(message.application_property("entityType").is_none());
        assert_eq!(message.body, Some(Value::List(Vec::new())));
    }

    #[test]
    fn test_reply_status_codes() {
        let ok = Message::new()
            .with_application_property("statusCode", Value::Int(200))
            .with_body(Value::List(vec![]));
        assert_eq!(ManagementReply::from_message(ok).unwrap().status_code, 200);

        let not_found = Message::new()
            .with_application_property("statusCode", Value::Int(404))
            .with_application_property("statusDescription", "Not Found");
        match ManagementReply::from_message(not_found) {
            Err(ManagementError::Remote {
                status_code,
                description,
            }) => {
                assert_eq!(status_code, 404);
                assert_eq!(description, "Not Found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raw_query_result_parsing() {
        let reply = ManagementReply {
            status_code: 200,
            status_description: None,
            body: Value::string_map([
                (
                    "attributeNames",
                    Value::List(vec![Value::from("role"), Value::from("container")]),
                ),
                (
                    "results",
                    Value::List(vec![
                        Value::List(vec![Value::from("edge"), Value::from("E1")]),
                        Value::List(vec![Value::from("normal"), Value::from("client")]),
                    ]),
                ),
            ]),
        };
        let result = RawQueryResult::from_reply(&reply).unwrap();
        assert_eq!(result.len(), 2);
        let records = result.records();
        assert_eq!(records[0].get("container"), Some(&Value::from("E1")));
        assert_eq!(records[1].get("role"), Some(&Value::from("normal")));

        let bad = ManagementReply {
            body: Value::List(vec![]),
            ..reply
        };
        assert!(RawQueryResult::from_reply(&bad).is_err());
    }
}
