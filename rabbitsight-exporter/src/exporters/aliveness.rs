//! Broker liveness probe via `/api/aliveness-test/{vhost}`.

use std::sync::Arc;

use async_trait::async_trait;
use rabbitsight_common::MetricDescriptor;
use serde_json::Value;
use tracing::warn;

use super::{Exporter, ExporterEnv, ExporterError, str_field};
use crate::client::{ClientError, UpstreamClient};
use crate::config::ConfigError;
use crate::scrape::ScrapeContext;

/// Percent-encode a vhost name as a single path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

pub struct AlivenessExporter {
    client: Arc<UpstreamClient>,
    vhost: String,
    path: String,
    descriptor: Arc<MetricDescriptor>,
}

impl AlivenessExporter {
    pub const NAME: &'static str = "aliveness";

    pub fn new(client: Arc<UpstreamClient>, vhost: impl Into<String>) -> Self {
        let vhost = vhost.into();
        Self {
            client,
            path: format!("/api/aliveness-test/{}", encode_segment(&vhost)),
            vhost,
            descriptor: MetricDescriptor::gauge(
                "rabbitmq_aliveness_test",
                "Aliveness test: declares a test queue, publishes and consumes a message.",
                &["vhost"],
            ),
        }
    }

    pub fn build(env: &ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError> {
        Ok(Box::new(Self::new(
            Arc::clone(&env.broker),
            env.settings.aliveness_vhost.clone(),
        )))
    }
}

#[async_trait]
impl Exporter for AlivenessExporter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        vec![Arc::clone(&self.descriptor)]
    }

    async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
        let alive = match self.client.get::<Value>(&self.path, &[]).await {
            Ok(body) => str_field(&body, "status") == "ok",
            // The broker answers a failed probe with an error status.
            Err(ClientError::Status { status, .. }) => {
                warn!(vhost = %self.vhost, %status, "Aliveness test failed");
                false
            }
            Err(e) => return Err(e.into()),
        };

        ctx.emit(&self.descriptor, &[self.vhost.as_str()], if alive { 1.0 } else { 0.0 })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeUpstream;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::time::Duration;

    async fn run_check(
        upstream: FakeUpstream,
        vhost: &str,
    ) -> (Result<(), ExporterError>, Option<f64>) {
        let base = upstream.start().await;
        let client = Arc::new(UpstreamClient::builder(base).build().unwrap());
        let exporter = AlivenessExporter::new(client, vhost);

        let (ctx, mut rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());
        let result = exporter.collect(&ctx).await;
        drop(ctx);
        (result, rx.recv().await.map(|s| s.value()))
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("/"), "%2F");
        assert_eq!(encode_segment("prod vhost"), "prod%20vhost");
        assert_eq!(encode_segment("orders-1"), "orders-1");
    }

    #[tokio::test]
    async fn test_alive() {
        let upstream = FakeUpstream::new().json("/api/aliveness-test/%2F", json!({"status": "ok"}));
        let (result, value) = run_check(upstream, "/").await;
        result.unwrap();
        assert_eq!(value, Some(1.0));
    }

    #[tokio::test]
    async fn test_failed_probe_reports_zero() {
        let upstream = FakeUpstream::new()
            .status("/api/aliveness-test/prod", StatusCode::SERVICE_UNAVAILABLE);
        let (result, value) = run_check(upstream, "prod").await;
        result.unwrap();
        assert_eq!(value, Some(0.0));
    }

    #[tokio::test]
    async fn test_unreachable_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = url::Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        drop(listener);

        let client = Arc::new(UpstreamClient::builder(base).build().unwrap());
        let exporter = AlivenessExporter::new(client, "/");
        let (ctx, _rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());
        assert!(matches!(
            exporter.collect(&ctx).await,
            Err(ExporterError::Client(ClientError::NoResponse { .. }))
        ));
    }
}
