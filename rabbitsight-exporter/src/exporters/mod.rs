//! Exporters: pluggable units that fetch upstream data and emit samples.
//!
//! Each exporter declares its metric families once, at construction, and
//! re-fetches everything on every scrape. Exporters never keep state between
//! scrapes.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::{MetricDescriptor, MetricError, to_f64};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::client::{ClientError, UpstreamClient};
use crate::config::{ConnectionMode, Settings};
use crate::scrape::ScrapeContext;

pub mod aliveness;
pub mod cpu;
pub mod exchange;
pub mod node;
pub mod overview;
pub mod queue;

pub use aliveness::AlivenessExporter;
pub use cpu::CpuExporter;
pub use exchange::ExchangeExporter;
pub use node::NodeExporter;
pub use overview::OverviewExporter;
pub use queue::QueueExporter;

/// Failure of one exporter for one scrape.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    /// The upstream answered but reported a failure of its own.
    #[error("upstream reported failure: {0}")]
    Upstream(String),
}

/// A metrics exporter.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Stable registry name (e.g. `"queue"`).
    fn name(&self) -> &'static str;

    /// Metric families this exporter may emit.
    fn describe(&self) -> Vec<Arc<MetricDescriptor>>;

    /// Fetch upstream data and push samples into `ctx`.
    ///
    /// Samples pushed before an error are kept by the orchestrator.
    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError>;
}

/// What exporter constructors receive.
#[derive(Debug, Clone)]
pub struct ExporterEnv {
    pub settings: Arc<Settings>,
    /// Shared management API client.
    pub broker: Arc<UpstreamClient>,
}

/// Resolve a dotted path such as `"message_stats.publish"`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// String field or `""` when missing.
pub fn str_field<'a>(value: &'a Value, path: &str) -> &'a str {
    lookup(value, path).and_then(Value::as_str).unwrap_or("")
}

/// Boolean field rendered as a label value.
pub fn bool_label(value: &Value, path: &str) -> &'static str {
    match lookup(value, path).and_then(Value::as_bool) {
        Some(true) => "true",
        _ => "false",
    }
}

/// A metric family read from one JSON field.
#[derive(Debug, Clone)]
pub struct FieldMetric {
    pub path: &'static str,
    pub descriptor: Arc<MetricDescriptor>,
}

impl FieldMetric {
    pub fn gauge(path: &'static str, name: &str, help: &str, labels: &[&str]) -> Self {
        Self {
            path,
            descriptor: MetricDescriptor::gauge(name, help, labels),
        }
    }

    pub fn counter(path: &'static str, name: &str, help: &str, labels: &[&str]) -> Self {
        Self {
            path,
            descriptor: MetricDescriptor::counter(name, help, labels),
        }
    }
}

/// Emit one sample per field present in `object`.
///
/// Missing fields are skipped. A value that cannot be coerced skips that
/// sample only.
pub fn emit_fields<S: AsRef<str>>(
    ctx: &ScrapeContext,
    module: &str,
    fields: &[FieldMetric],
    object: &Value,
    labels: &[S],
) -> Result<usize, MetricError> {
    let mut emitted = 0;
    for field in fields {
        let Some(raw) = lookup(object, field.path) else {
            continue;
        };
        match to_f64(raw) {
            Ok(value) => {
                if ctx.emit(&field.descriptor, labels, value)? {
                    emitted += 1;
                }
            }
            Err(e) => debug!(
                module,
                field = field.path,
                error = %e,
                "Skipping non-numeric value"
            ),
        }
    }
    Ok(emitted)
}

pub fn field_descriptors(
    fields: &[FieldMetric],
) -> impl Iterator<Item = Arc<MetricDescriptor>> + '_ {
    fields.iter().map(|f| Arc::clone(&f.descriptor))
}

/// Value of the `self` label for an entity living on `entity_node`.
pub fn self_label(mode: ConnectionMode, entity_node: &str, local_node: &str) -> &'static str {
    match mode {
        ConnectionMode::LoadBalancer => "lb",
        ConnectionMode::Direct if !local_node.is_empty() && entity_node == local_node => "1",
        ConnectionMode::Direct => "0",
    }
}

/// Cluster identity as reported by `/api/overview`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub cluster: String,
    /// Node that answered the API request.
    pub node: String,
}

impl ClusterInfo {
    pub const PATH: &'static str = "/api/overview";

    pub fn from_overview(overview: &Value) -> Self {
        Self {
            cluster: str_field(overview, "cluster_name").to_string(),
            node: str_field(overview, "node").to_string(),
        }
    }

    pub async fn fetch(client: &UpstreamClient) -> Result<Self, ClientError> {
        let overview: Value = client.get(Self::PATH, &[]).await?;
        Ok(Self::from_overview(&overview))
    }
}

/// Query parameters for entity listings.
pub fn listing_query(stable_ordering: bool) -> &'static [(&'static str, &'static str)] {
    if stable_ordering {
        &[("sort", "name")]
    } else {
        &[]
    }
}

/// Sort entities by `(vhost, name)`.
pub fn sort_entities(entities: &mut [Value]) {
    entities.sort_by(|a, b| entity_key(a).cmp(&entity_key(b)));
}

fn entity_key(entity: &Value) -> (&str, &str) {
    (str_field(entity, "vhost"), str_field(entity, "name"))
}
