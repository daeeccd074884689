//! Gauge definitions and rendering.
//!
//! Each (entity, attribute) pair of the configured stat groups becomes one
//! gauge named `qdmetrics_<attribute>`, labelled by router and, for entities
//! other than `router`, by instance name.

use std::collections::HashSet;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use qdmetrics_amqp::Value;
use qdmetrics_config::StatGroup;
use qdmetrics_management::{CollectedStats, RouterId, Schema};
use tracing::trace;

use crate::ExporterResult;

pub const METRIC_PREFIX: &str = "qdmetrics";
pub const ROUTER_LABEL: &str = "router";
const NAME_ATTRIBUTE: &str = "name";

/// One gauge: where its values come from and how it is labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeSpec {
    /// Index of the stat group the values come from.
    pub group: usize,
    pub entity: String,
    pub attribute: String,
    pub metric_name: String,
    pub help: String,
    /// Label carrying the instance name; `None` for the `router` entity.
    pub label_key: Option<String>,
    pub alias: Option<String>,
}

impl GaugeSpec {
    fn label_names(&self) -> Vec<&str> {
        let mut names = vec![ROUTER_LABEL];
        if let Some(key) = &self.label_key {
            names.push(key);
        }
        names
    }
}

/// The gauges of one schema generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GaugeSet {
    specs: Vec<GaugeSpec>,
}

impl GaugeSet {
    /// Builds the gauge list. Help text comes from the schema when it
    /// describes the attribute. A metric name already taken by an earlier
    /// group is qualified with the entity name.
    pub fn new(groups: &[StatGroup], schema: Option<&Schema>) -> Self {
        let mut taken = HashSet::new();
        let mut specs = Vec::new();

        for (index, group) in groups.iter().enumerate() {
            let mut seen = HashSet::new();
            for attribute in &group.attributes {
                if attribute == NAME_ATTRIBUTE || !seen.insert(attribute.as_str()) {
                    continue;
                }

                let mut metric_name = format!("{METRIC_PREFIX}_{}", sanitize(attribute));
                if taken.contains(&metric_name) {
                    metric_name = format!(
                        "{METRIC_PREFIX}_{}_{}",
                        sanitize(&group.entity),
                        sanitize(attribute)
                    );
                }
                if !taken.insert(metric_name.clone()) {
                    continue;
                }

                let help = schema
                    .and_then(|s| s.attribute_description(&group.entity, attribute))
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or(attribute.as_str())
                    .to_string();

                let label_key = group.instance_label().map(|label| {
                    let key = sanitize(label);
                    if key == ROUTER_LABEL {
                        format!("{key}_{NAME_ATTRIBUTE}")
                    } else {
                        key
                    }
                });

                specs.push(GaugeSpec {
                    group: index,
                    entity: group.entity.clone(),
                    attribute: attribute.clone(),
                    metric_name,
                    help,
                    label_key,
                    alias: group.alias.clone(),
                });
            }
        }

        Self { specs }
    }

    pub fn specs(&self) -> &[GaugeSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Registers every gauge in a fresh registry and sets it from one
    /// collection. `results[group][j]` belongs to `topology[j]`.
    pub fn populate(&self, topology: &[RouterId], results: &CollectedStats) -> ExporterResult<Registry> {
        let registry = Registry::new();

        for spec in &self.specs {
            let gauge = GaugeVec::new(
                Opts::new(spec.metric_name.clone(), spec.help.clone()),
                &spec.label_names(),
            )?;
            registry.register(Box::new(gauge.clone()))?;

            let Some(per_router) = results.get(spec.group) else {
                continue;
            };
            for (router, result) in topology.iter().zip(per_router) {
                for record in result.records() {
                    let Some(value) = record.get(&spec.attribute).and_then(Value::as_f64) else {
                        trace!(metric = %spec.metric_name, router = router.name(), "non-numeric value skipped");
                        continue;
                    };
                    let instance = record
                        .get(NAME_ATTRIBUTE)
                        .and_then(Value::as_str)
                        .unwrap_or_default();

                    let mut labels = vec![router.name()];
                    if spec.label_key.is_some() {
                        labels.push(instance);
                    }
                    gauge.with_label_values(&labels).set(value);
                }
            }
        }

        Ok(registry)
    }

    /// Renders one collection in the Prometheus text format.
    pub fn render(&self, topology: &[RouterId], results: &CollectedStats) -> ExporterResult<Vec<u8>> {
        let registry = self.populate(topology, results)?;
        let mut body = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut body)?;
        Ok(body)
    }
}

/// Content type of [`GaugeSet::render`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

/// Maps a name onto the metric and label name alphabet.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
