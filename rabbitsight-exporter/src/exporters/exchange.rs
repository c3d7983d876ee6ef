//! Exchange message rates from `/api/exchanges`.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use serde_json::Value;
use tracing::debug;

use super::{
    ClusterInfo, Exporter, ExporterEnv, ExporterError, FieldMetric, emit_fields,
    field_descriptors, listing_query, sort_entities, str_field,
};
use crate::client::UpstreamClient;
use crate::config::ConfigError;
use crate::filter::{EntityClass, EntityFilter};
use crate::scrape::ScrapeContext;

const LABELS: &[&str] = &["cluster", "vhost", "exchange"];

pub struct ExchangeExporter {
    client: Arc<UpstreamClient>,
    filter: EntityFilter,
    stable_ordering: bool,
    fields: Vec<FieldMetric>,
}

impl ExchangeExporter {
    pub const NAME: &'static str = "exchange";
    const PATH: &'static str = "/api/exchanges";

    pub fn new(client: Arc<UpstreamClient>, filter: EntityFilter, stable_ordering: bool) -> Self {
        let fields = vec![
            FieldMetric::counter(
                "message_stats.publish_in",
                "rabbitmq_exchange_messages_published_in_total",
                "Count of messages published in to an exchange, i.e. not taking account of routing.",
                LABELS,
            ),
            FieldMetric::counter(
                "message_stats.publish_out",
                "rabbitmq_exchange_messages_published_out_total",
                "Count of messages published out of an exchange, i.e. taking account of routing.",
                LABELS,
            ),
        ];

        Self {
            client,
            filter,
            stable_ordering,
            fields,
        }
    }

    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        Ok(Box::new(Self::new(
            Arc::clone(&env.broker),
            env.settings.filter.clone(),
            env.settings.capabilities.stable_ordering(),
        )))
    }
}

#[async_trait]
impl Exporter for ExchangeExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        field_descriptors(&self.fields).collect()
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let cluster = ClusterInfo::fetch(&self.client).await?;
        let mut exchanges: Vec<Value> = self
            .client
            .get(Self::PATH, listing_query(self.stable_ordering))
            .await?;
        if self.stable_ordering {
            sort_entities(&mut exchanges);
        }

        let mut pass = self.filter.pass(EntityClass::Exchange);
        for exchange in &exchanges {
            if pass.is_full() {
                break;
            }

            let vhost = str_field(exchange, "vhost");
            if !self.filter.should_report(EntityClass::Vhost, vhost) {
                continue;
            }
            let name = str_field(exchange, "name");
            if !pass.admit(name) {
                continue;
            }

            emit_fields(
                ctx,
                Self::NAME,
                &self.fields,
                exchange,
                &[cluster.cluster.as_str(), vhost, name],
            )?;
        }

        debug!(total = exchanges.len(), reported = pass.accepted(), "Collected exchanges");
        Ok(())
    }
}
