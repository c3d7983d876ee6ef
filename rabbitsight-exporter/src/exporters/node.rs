//! Per-node resource usage from `/api/nodes`.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use serde_json::Value;
use tracing::debug;

use super::{
    ClusterInfo, Exporter, ExporterEnv, ExporterError, FieldMetric, emit_fields,
    field_descriptors, self_label, str_field,
};
use crate::client::UpstreamClient;
use crate::config::{ConfigError, ConnectionMode};
use crate::scrape::ScrapeContext;

const LABELS: &[&str] = &["cluster", "node", "self"];

pub struct NodeExporter {
    client: Arc<UpstreamClient>,
    connection: ConnectionMode,
    fields: Vec<FieldMetric>,
    partitions: Arc<MetricDescriptor>,
}

impl NodeExporter {
    pub const NAME: &'static str = "node";
    const PATH: &'static str = "/api/nodes";

    pub fn new(client: Arc<UpstreamClient>, connection: ConnectionMode) -> Self {
        let gauge = |path, name, help| FieldMetric::gauge(path, name, help, LABELS);
        let fields = vec![
            gauge("running", "rabbitmq_running", "Test if rabbitmq node is running."),
            gauge("uptime", "rabbitmq_uptime", "Uptime in milliseconds."),
            gauge("mem_used", "rabbitmq_node_mem_used", "Memory used in bytes."),
            gauge(
                "mem_limit",
                "rabbitmq_node_mem_limit",
                "Point at which the memory alarm will go off.",
            ),
            gauge("mem_alarm", "rabbitmq_node_mem_alarm", "Whether the memory alarm has gone off."),
            gauge("disk_free", "rabbitmq_node_disk_free", "Disk free space in bytes."),
            gauge(
                "disk_free_limit",
                "rabbitmq_node_disk_free_limit",
                "Point at which the disk alarm will go off.",
            ),
            gauge(
                "disk_free_alarm",
                "rabbitmq_node_disk_free_alarm",
                "Whether the disk alarm has gone off.",
            ),
            gauge("fd_used", "rabbitmq_fd_used", "Used File descriptors."),
            gauge("fd_total", "rabbitmq_fd_available", "File descriptors available."),
            gauge("sockets_used", "rabbitmq_sockets_used", "File descriptors used as sockets."),
            gauge(
                "sockets_total",
                "rabbitmq_sockets_available",
                "File descriptors available for use as sockets.",
            ),
            gauge("proc_used", "rabbitmq_erlang_processes_used", "Number of processes in use."),
            gauge(
                "proc_total",
                "rabbitmq_erlang_processes_available",
                "Maximum number of processes.",
            ),
        ];

        Self {
            client,
            connection,
            fields,
            partitions: MetricDescriptor::gauge(
                "rabbitmq_partitions",
                "Number of network partitions this node is seeing.",
                LABELS,
            ),
        }
    }

    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        Ok(Box::new(Self::new(
            Arc::clone(&env.broker),
            env.settings.connection,
        )))
    }
}

#[async_trait]
impl Exporter for NodeExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        field_descriptors(&self.fields)
            .chain(std::iter::once(Arc::clone(&self.partitions)))
            .collect()
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let cluster = ClusterInfo::fetch(&self.client).await?;
        let nodes: Vec<Value> = self.client.get(Self::PATH, &[]).await?;
        debug!(count = nodes.len(), "Fetched nodes");

        for node in &nodes {
            let name = str_field(node, "name");
            let labels = [
                cluster.cluster.as_str(),
                name,
                self_label(self.connection, name, &cluster.node),
            ];

            emit_fields(ctx, Self::NAME, &self.fields, node, &labels)?;

            if let Some(partitions) = node.get("partitions").and_then(Value::as_array) {
                ctx.emit(&self.partitions, &labels, partitions.len() as f64)?;
            }
        }

        Ok(())
    }
}
