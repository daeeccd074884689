//! Router entity schema and its per-connection cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use qdmetrics_amqp::Value;
use tracing::debug;

use crate::SchemaError;

/// Identifies an instance; every entity answers it.
const NAME_ATTRIBUTE: &str = "name";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSchema {
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub fully_qualified_type: String,
    pub attributes: BTreeMap<String, AttributeSchema>,
}

/// Entity types keyed by short name, with deprecated entries removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entity_types: BTreeMap<String, EntitySchema>,
}

impl Schema {
    /// Builds a schema from a GET-SCHEMA reply body, dropping deprecated
    /// entities and deprecated attributes of the remaining ones.
    pub fn from_reply(body: &Value) -> Result<Self, SchemaError> {
        let entity_types = body
            .get("entityTypes")
            .and_then(Value::as_map)
            .ok_or_else(|| malformed("reply has no entityTypes map"))?;

        let mut schema = Schema::default();
        for (key, entity) in entity_types {
            let short_name = key
                .as_str()
                .ok_or_else(|| malformed(format!("entity key is not a string: {key}")))?;
            if is_deprecated(entity) {
                debug!(entity = short_name, "skipping deprecated entity");
                continue;
            }

            let fully_qualified_type = entity
                .get("fullyQualifiedType")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(format!("{short_name} has no fullyQualifiedType")))?
                .to_string();

            let mut attributes = BTreeMap::new();
            if let Some(attrs) = entity.get("attributes").and_then(Value::as_map) {
                for (name, attribute) in attrs {
                    let Some(name) = name.as_str() else { continue };
                    if is_deprecated(attribute) {
                        continue;
                    }
                    let description = attribute
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    attributes.insert(name.to_string(), AttributeSchema { description });
                }
            }

            schema.entity_types.insert(
                short_name.to_string(),
                EntitySchema {
                    fully_qualified_type,
                    attributes,
                },
            );
        }
        Ok(schema)
    }

    pub fn entity(&self, short_name: &str) -> Option<&EntitySchema> {
        self.entity_types.get(short_name)
    }

    pub fn fully_qualified_type(&self, short_name: &str) -> Result<&str, SchemaError> {
        self.entity(short_name)
            .map(|entity| entity.fully_qualified_type.as_str())
            .ok_or_else(|| SchemaError::UnknownEntity {
                entity: short_name.to_string(),
            })
    }

    /// Resolves `short_name` and checks that it has every attribute in
    /// `attributes`. `name` is always accepted.
    pub fn query_type<S: AsRef<str>>(&self, short_name: &str, attributes: &[S]) -> Result<&str, SchemaError> {
        let entity = self.entity(short_name).ok_or_else(|| SchemaError::UnknownEntity {
            entity: short_name.to_string(),
        })?;
        let unknown = attributes
            .iter()
            .map(AsRef::as_ref)
            .find(|a| *a != NAME_ATTRIBUTE && !entity.attributes.contains_key(*a));
        match unknown {
            Some(attribute) => Err(SchemaError::UnknownAttribute {
                entity: short_name.to_string(),
                attribute: attribute.to_string(),
            }),
            None => Ok(&entity.fully_qualified_type),
        }
    }

    pub fn attribute_description(&self, entity: &str, attribute: &str) -> Option<&str> {
        self.entity(entity)?
            .attributes
            .get(attribute)?
            .description
            .as_deref()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entity_types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entity_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty()
    }
}

fn is_deprecated(value: &Value) -> bool {
    value
        .get("deprecated")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn malformed(message: impl Into<String>) -> SchemaError {
    SchemaError::Malformed {
        message: message.into(),
    }
}

/// Holds the schema of the current connection. Replaced wholesale, never merged.
#[derive(Debug, Default)]
pub struct SchemaCache {
    current: RwLock<Option<Arc<Schema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        *self.current.write() = Some(schema.clone());
        schema
    }

    pub fn clear(&self) {
        self.current.write().take();
    }

    pub fn get(&self) -> Option<Arc<Schema>> {
        self.current.read().clone()
    }

    /// Resolves a short entity name against the loaded schema.
    pub fn resolve(&self, short_name: &str) -> Result<String, SchemaError> {
        let guard = self.current.read();
        let schema = guard.as_ref().ok_or(SchemaError::NotLoaded)?;
        schema.fully_qualified_type(short_name).map(str::to_string)
    }

    /// Like [`SchemaCache::resolve`], also checking the queried attributes.
    pub fn resolve_query<S: AsRef<str>>(&self, short_name: &str, attributes: &[S]) -> Result<String, SchemaError> {
        let guard = self.current.read();
        let schema = guard.as_ref().ok_or(SchemaError::NotLoaded)?;
        schema.query_type(short_name, attributes).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(description: &str, deprecated: bool) -> Value {
        Value::string_map([
            ("description", Value::from(description)),
            ("deprecated", Value::Bool(deprecated)),
        ])
    }

    fn sample() -> Value {
        let router = Value::string_map([
            ("fullyQualifiedType", Value::from("org.apache.qpid.dispatch.router")),
            (
                "attributes",
                Value::string_map([
                    ("name", attribute("Router name", false)),
                    ("deliveriesIngress", attribute("Deliveries received", false)),
                    ("mode", attribute("Old mode flag", true)),
                ]),
            ),
        ]);
        let container = Value::string_map([
            ("fullyQualifiedType", Value::from("org.apache.qpid.dispatch.container")),
            ("deprecated", Value::Bool(true)),
            ("attributes", Value::string_map::<_, String>([])),
        ]);
        Value::string_map([(
            "entityTypes",
            Value::string_map([("router", router), ("container", container)]),
        )])
    }

    #[test]
    fn test_deprecated_entries_removed() {
        let schema = Schema::from_reply(&sample()).unwrap();
        assert_eq!(schema.len(), 1);
        assert!(schema.entity("container").is_none());

        let router = schema.entity("router").unwrap();
        assert!(router.attributes.contains_key("deliveriesIngress"));
        assert!(!router.attributes.contains_key("mode"));
    }

    #[test]
    fn test_resolve_short_name() {
        let schema = Schema::from_reply(&sample()).unwrap();
        assert_eq!(
            schema.fully_qualified_type("router").unwrap(),
            "org.apache.qpid.dispatch.router"
        );
        assert_eq!(
            schema.fully_qualified_type("container"),
            Err(SchemaError::UnknownEntity {
                entity: "container".to_string()
            })
        );
        assert_eq!(
            schema.attribute_description("router", "deliveriesIngress"),
            Some("Deliveries received")
        );
    }

    #[test]
    fn test_query_attributes_checked() {
        let schema = Schema::from_reply(&sample()).unwrap();
        assert_eq!(
            schema.query_type("router", &["deliveriesIngress", "name"]).unwrap(),
            "org.apache.qpid.dispatch.router"
        );
        assert_eq!(
            schema.query_type("router", &["deliveriesIngress", "mode"]),
            Err(SchemaError::UnknownAttribute {
                entity: "router".to_string(),
                attribute: "mode".to_string()
            })
        );
        assert!(matches!(
            schema.query_type("container", &["name"]),
            Err(SchemaError::UnknownEntity { .. })
        ));

        let empty: &[String] = &[];
        assert!(schema.query_type("router", empty).is_ok());
    }

    #[test]
    fn test_malformed_reply() {
        assert!(matches!(
            Schema::from_reply(&Value::List(vec![])),
            Err(SchemaError::Malformed { .. })
        ));
        let missing_type = Value::string_map([(
            "entityTypes",
            Value::string_map([("router", Value::string_map::<_, String>([]))]),
        )]);
        assert!(Schema::from_reply(&missing_type).is_err());
    }

    #[test]
    fn test_cache_replaced_and_cleared() {
        let cache = SchemaCache::new();
        assert_eq!(cache.resolve("router"), Err(SchemaError::NotLoaded));

        cache.store(Schema::from_reply(&sample()).unwrap());
        assert!(cache.resolve("router").is_ok());

        cache.store(Schema::default());
        assert!(matches!(
            cache.resolve("router"),
            Err(SchemaError::UnknownEntity { .. })
        ));

        cache.clear();
        assert!(cache.get().is_none());
    }
}
