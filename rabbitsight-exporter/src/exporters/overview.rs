//! Cluster-wide totals from `/api/overview`.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use serde_json::Value;

use super::{
    ClusterInfo, Exporter, ExporterEnv, ExporterError, FieldMetric, emit_fields,
    field_descriptors, str_field,
};
use crate::client::UpstreamClient;
use crate::config::ConfigError;
use crate::scrape::ScrapeContext;

const LABELS: &[&str] = &["cluster"];

pub struct OverviewExporter {
    client: Arc<UpstreamClient>,
    fields: Vec<FieldMetric>,
    version_info: Arc<MetricDescriptor>,
}

impl OverviewExporter {
    pub const NAME: &'static str = "overview";

    pub fn new(client: Arc<UpstreamClient>) -> Self {
        let total = |path, name, help| FieldMetric::gauge(path, name, help, LABELS);
        let fields = vec![
            total("object_totals.channels", "rabbitmq_channels", "Number of channels."),
            total("object_totals.connections", "rabbitmq_connections", "Number of connections."),
            total("object_totals.consumers", "rabbitmq_consumers", "Number of message consumers."),
            total("object_totals.queues", "rabbitmq_queues", "Number of queues in use."),
            total("object_totals.exchanges", "rabbitmq_exchanges", "Number of exchanges in use."),
            FieldMetric::gauge(
                "queue_totals.messages",
                "rabbitmq_queue_messages_global",
                "Number ready and unacknowledged messages in cluster.",
                LABELS,
            ),
            FieldMetric::gauge(
                "queue_totals.messages_ready",
                "rabbitmq_queue_messages_ready_global",
                "Number of messages ready to be delivered to clients.",
                LABELS,
            ),
            FieldMetric::gauge(
                "queue_totals.messages_unacknowledged",
                "rabbitmq_queue_messages_unacknowledged_global",
                "Number of messages delivered to clients but not yet acknowledged.",
                LABELS,
            ),
            FieldMetric::counter(
                "message_stats.publish",
                "rabbitmq_messages_published_total",
                "Count of messages published.",
                LABELS,
            ),
            FieldMetric::counter(
                "message_stats.deliver_get",
                "rabbitmq_messages_delivered_total",
                "Count of messages delivered in acknowledgement mode or retrieved with basic.get.",
                LABELS,
            ),
            FieldMetric::counter(
                "message_stats.ack",
                "rabbitmq_messages_acknowledged_total",
                "Count of messages acknowledged by consumers.",
                LABELS,
            ),
            FieldMetric::counter(
                "message_stats.redeliver",
                "rabbitmq_messages_redelivered_total",
                "Count of messages redelivered.",
                LABELS,
            ),
        ];

        Self {
            client,
            fields,
            version_info: MetricDescriptor::gauge(
                "rabbitmq_version_info",
                "A metric with a constant '1' value labeled by rabbitmq and erlang versions.",
                &["cluster", "rabbitmq", "erlang"],
            ),
        }
    }

    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        Ok(Box::new(Self::new(Arc::clone(&env.broker))))
    }
}

#[async_trait]
impl Exporter for OverviewExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        field_descriptors(&self.fields)
            .chain(std::iter::once(Arc::clone(&self.version_info)))
            .collect()
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let overview: Value = self.client.get(ClusterInfo::PATH, &[]).await?;
        let cluster = ClusterInfo::from_overview(&overview).cluster;

        emit_fields(ctx, Self::NAME, &self.fields, &overview, &[cluster.as_str()])?;

        let rabbitmq = str_field(&overview, "rabbitmq_version");
        let erlang = str_field(&overview, "erlang_version");
        if !rabbitmq.is_empty() || !erlang.is_empty() {
            ctx.emit(&self.version_info, &[cluster.as_str(), rabbitmq, erlang], 1.0)?;
        }

        Ok(())
    }
}
