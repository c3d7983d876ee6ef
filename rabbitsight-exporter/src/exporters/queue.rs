//! Per-queue depth, consumers and message rates from `/api/queues`.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use serde_json::Value;
use tracing::debug;

use super::{
    ClusterInfo, Exporter, ExporterEnv, ExporterError, FieldMetric, bool_label, emit_fields,
    field_descriptors, listing_query, self_label, sort_entities, str_field,
};
use crate::client::UpstreamClient;
use crate::config::{ConfigError, ConnectionMode};
use crate::filter::{EntityClass, EntityFilter};
use crate::scrape::ScrapeContext;

const LABELS: &[&str] = &["cluster", "vhost", "queue", "durable", "policy", "self"];

pub struct QueueExporter {
    client: Arc<UpstreamClient>,
    filter: EntityFilter,
    connection: ConnectionMode,
    stable_ordering: bool,
    fields: Vec<FieldMetric>,
}

impl QueueExporter {
    pub const NAME: &'static str = "queue";
    const PATH: &'static str = "/api/queues";

    pub fn new(
        client: Arc<UpstreamClient>,
        filter: EntityFilter,
        connection: ConnectionMode,
        stable_ordering: bool,
    ) -> Self {
        let gauge = |path, name, help| FieldMetric::gauge(path, name, help, LABELS);
        let counter = |path, name, help| FieldMetric::counter(path, name, help, LABELS);
        let fields = vec![
            gauge(
                "messages_ready",
                "rabbitmq_queue_messages_ready",
                "Number of messages ready to be delivered to clients.",
            ),
            gauge(
                "messages_unacknowledged",
                "rabbitmq_queue_messages_unacknowledged",
                "Number of messages delivered to clients but not yet acknowledged.",
            ),
            gauge(
                "messages",
                "rabbitmq_queue_messages",
                "Sum of ready and unacknowledged messages (queue depth).",
            ),
            gauge("consumers", "rabbitmq_queue_consumers", "Number of consumers."),
            gauge(
                "memory",
                "rabbitmq_queue_memory",
                "Bytes of memory consumed by the Erlang process associated with the queue.",
            ),
            gauge(
                "consumer_utilisation",
                "rabbitmq_queue_consumer_utilisation",
                "Fraction of the time that the queue is able to immediately deliver messages to consumers.",
            ),
            counter(
                "message_stats.publish",
                "rabbitmq_queue_messages_published_total",
                "Count of messages published.",
            ),
            counter(
                "message_stats.deliver_get",
                "rabbitmq_queue_messages_delivered_total",
                "Count of messages delivered in acknowledgement mode or retrieved with basic.get.",
            ),
            counter(
                "message_stats.ack",
                "rabbitmq_queue_messages_acknowledged_total",
                "Count of messages acknowledged by consumers.",
            ),
            counter(
                "message_stats.redeliver",
                "rabbitmq_queue_messages_redelivered_total",
                "Count of messages redelivered.",
            ),
        ];

        Self {
            client,
            filter,
            connection,
            stable_ordering,
            fields,
        }
    }

    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        let settings = &env.settings;
        Ok(Box::new(Self::new(
            Arc::clone(&env.broker),
            settings.filter.clone(),
            settings.connection,
            settings.capabilities.stable_ordering(),
        )))
    }
}

#[async_trait]
impl Exporter for QueueExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        field_descriptors(&self.fields).collect()
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let cluster = ClusterInfo::fetch(&self.client).await?;
        let mut queues: Vec<Value> = self
            .client
            .get(Self::PATH, listing_query(self.stable_ordering))
            .await?;
        if self.stable_ordering {
            sort_entities(&mut queues);
        }

        let mut pass = self.filter.pass(EntityClass::Queue);
        for queue in &queues {
            if pass.is_full() {
                debug!(limit = self.filter.max_entities(), "Queue limit reached");
                break;
            }

            let vhost = str_field(queue, "vhost");
            if !self.filter.should_report(EntityClass::Vhost, vhost) {
                continue;
            }
            let name = str_field(queue, "name");
            if !pass.admit(name) {
                continue;
            }

            let labels = [
                cluster.cluster.as_str(),
                vhost,
                name,
                bool_label(queue, "durable"),
                str_field(queue, "policy"),
                self_label(self.connection, str_field(queue, "node"), &cluster.node),
            ];
            emit_fields(ctx, Self::NAME, &self.fields, queue, &labels)?;
        }

        debug!(total = queues.len(), reported = pass.accepted(), "Collected queues");
        Ok(())
    }
}
