//! Aggregated container CPU utilization from the Prometheus query API.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use tracing::{debug, warn};

use super::{Exporter, ExporterEnv, ExporterError};
use crate::client::{ClientError, UpstreamClient};
use crate::config::{ConfigError, CpuTarget};
use crate::scrape::ScrapeContext;

const CONTAINER: &str = "rabbitmq-k8s";

/// Build the 5 minute CPU rate query for one RabbitMQ deployment.
pub fn utilization_query(namespace: &str, resource_id: &str) -> String {
    format!(
        "sum(rate(container_cpu_usage_seconds_total{{namespace=\"{}\", container=\"{}\", pod=~\"rmq-{}.*\"}}[5m])) by (node, container)",
        namespace, CONTAINER, resource_id
    )
}

pub struct CpuExporter {
    client: UpstreamClient,
    query: String,
    instance_guid: String,
    descriptor: Arc<MetricDescriptor>,
}

impl CpuExporter {
    pub const NAME: &'static str = "cpu";

    pub fn new(client: UpstreamClient, target: &CpuTarget) -> Self {
        Self {
            client,
            query: utilization_query(&target.namespace, &target.resource_id),
            instance_guid: target.instance_guid.clone(),
            descriptor: MetricDescriptor::gauge(
                "rabbitmq:cpu_utilization:rate5m",
                "rabbitmq_exporter: CPU utilization",
                &["hsdp_instance_guid", "hsdp_instance_node_name"],
            ),
        }
    }

    /// Requires a Prometheus host; the query client always speaks JSON.
    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        let settings = &env.settings;
        let base = settings
            .prometheus
            .clone()
            .ok_or_else(|| ConfigError::Unavailable {
                exporter: Self::NAME,
                reason: "no prometheus host configured".to_string(),
            })?;

        let client = UpstreamClient::builder(base)
            .timeout(settings.timeout)
            .build()
            .map_err(|e: ClientError| ConfigError::Validation(e.to_string()))?;

        Ok(Box::new(Self::new(client, &settings.cpu)))
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

#[async_trait]
impl Exporter for CpuExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        vec![Arc::clone(&self.descriptor)]
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let response = self.client.query(&self.query).await?;
        if response.status == "error" {
            return Err(ExporterError::Upstream(
                response.error.unwrap_or_else(|| "query failed".to_string()),
            ));
        }

        debug!(rows = response.data.result.len(), "CPU query returned");

        for row in &response.data.result {
            let node = row
                .metric
                .get("node")
                .or_else(|| row.metric.get("pod"))
                .map(String::as_str)
                .unwrap_or("");

            let value = match row.sample().map(|s| s.to_f64()) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    warn!(node, error = %e, "Skipping CPU row with invalid value");
                    continue;
                }
                None => {
                    warn!(node, "Skipping CPU row without a value");
                    continue;
                }
            };

            ctx.emit(&self.descriptor, &[self.instance_guid.as_str(), node], value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QUERY_PATH;
    use crate::config::{ExporterConfig, Settings};
    use crate::testing::FakeUpstream;
    use rabbitsight_common::MetricSample;
    use serde_json::json;
    use std::time::Duration;

    fn target() -> CpuTarget {
        CpuTarget {
            resource_id: "abc".to_string(),
            instance_guid: "guid-1".to_string(),
            namespace: "ns1".to_string(),
        }
    }

    async fn run(upstream: FakeUpstream) -> (Result<(), ExporterError>, Vec<MetricSample>) {
        let base = upstream.start().await;
        let exporter = CpuExporter::new(UpstreamClient::builder(base).build().unwrap(), &target());

        let (ctx, mut rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());
        let result = exporter.collect(&ctx).await;
        drop(ctx);

        let mut samples = Vec::new();
        while let Some(s) = rx.recv().await {
            samples.push(s);
        }
        (result, samples)
    }

    #[test]
    fn test_query_template() {
        assert_eq!(
            utilization_query("ns1", "abc"),
            r#"sum(rate(container_cpu_usage_seconds_total{namespace="ns1", container="rabbitmq-k8s", pod=~"rmq-abc.*"}[5m])) by (node, container)"#
        );
    }

    #[tokio::test]
    async fn test_rows_become_gauges() {
        let upstream = FakeUpstream::new().json(
            QUERY_PATH,
            json!({
                "status": "success",
                "data": {"resultType": "vector", "result": [
                    {"metric": {"node": "n1", "container": "rabbitmq-k8s"}, "value": [1700000000.1, "0.42"]},
                    {"metric": {"node": "n2"}, "value": [1700000000.1, "bogus"]},
                    {"metric": {"pod": "rmq-abc-0"}, "value": [1700000000.1, 0.1]},
                    {"metric": {"node": "n4"}, "value": []}
                ]}
            }),
        );

        let (result, samples) = run(upstream).await;
        result.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name(), "rabbitmq:cpu_utilization:rate5m");
        assert_eq!(samples[0].label("hsdp_instance_guid"), Some("guid-1"));
        assert_eq!(samples[0].label("hsdp_instance_node_name"), Some("n1"));
        assert_eq!(samples[0].value(), 0.42);
        assert_eq!(samples[1].label("hsdp_instance_node_name"), Some("rmq-abc-0"));
    }

    #[tokio::test]
    async fn test_empty_result() {
        let upstream = FakeUpstream::new().json(
            QUERY_PATH,
            json!({"status": "success", "data": {"resultType": "vector", "result": []}}),
        );
        let (result, samples) = run(upstream).await;
        result.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let upstream = FakeUpstream::new().json(
            QUERY_PATH,
            json!({"status": "error", "errorType": "bad_data", "error": "parse error"}),
        );
        let (result, samples) = run(upstream).await;
        assert!(matches!(result, Err(ExporterError::Upstream(ref m)) if m == "parse error"));
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_build_requires_prometheus_host() {
        let settings = Arc::new(Settings::from_defaults().unwrap());
        let broker = Arc::new(
            UpstreamClient::builder(settings.rabbit_url.clone())
                .build()
                .unwrap(),
        );
        let env = ExporterEnv {
            settings,
            broker: Arc::clone(&broker),
        };
        assert!(matches!(
            CpuExporter::build(&env),
            Err(ConfigError::Unavailable { exporter: "cpu", .. })
        ));

        let config = ExporterConfig {
            prometheus_host: "prometheus".to_string(),
            ..Default::default()
        };
        let env = ExporterEnv {
            settings: Arc::new(config.resolve().unwrap()),
            broker,
        };
        let exporter = CpuExporter::build(&env).unwrap();
        assert_eq!(exporter.name(), "cpu");
    }
}
