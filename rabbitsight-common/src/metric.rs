use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building metric samples.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricError {
    #[error("metric {name} expects {expected} label values, got {actual}")]
    LabelArity {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Metric family type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing value.
    Counter,
    /// Value that can go up or down.
    Gauge,
}

impl MetricKind {
    /// Get the TYPE string used by the text exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The declared shape of a metric family.
///
/// A descriptor is built once, when its exporter is constructed, and shared
/// by every sample of the family through an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Full metric name (e.g. `rabbitmq_queue_messages_ready`).
    pub name: String,

    /// Help text rendered on the `# HELP` line.
    pub help: String,

    /// Family type.
    pub kind: MetricKind,

    /// Label names, in rendering order.
    pub label_names: Vec<String>,
}

impl MetricDescriptor {
    /// Create a new descriptor.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        kind: MetricKind,
        label_names: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Create a shared gauge descriptor.
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, labels: &[&str]) -> Arc<Self> {
        Arc::new(Self::new(name, help, MetricKind::Gauge, labels))
    }

    /// Create a shared counter descriptor.
    pub fn counter(name: impl Into<String>, help: impl Into<String>, labels: &[&str]) -> Arc<Self> {
        Arc::new(Self::new(name, help, MetricKind::Counter, labels))
    }
}

/// One labelled value of a metric family for a single scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    descriptor: Arc<MetricDescriptor>,
    label_values: Vec<String>,
    value: f64,
}

impl MetricSample {
    /// Build a sample; the label values must match the descriptor's label names
    /// one for one.
    pub fn new<S: AsRef<str>>(
        descriptor: &Arc<MetricDescriptor>,
        label_values: &[S],
        value: f64,
    ) -> Result<Self, MetricError> {
        if label_values.len() != descriptor.label_names.len() {
            return Err(MetricError::LabelArity {
                name: descriptor.name.clone(),
                expected: descriptor.label_names.len(),
                actual: label_values.len(),
            });
        }

        Ok(Self {
            descriptor: Arc::clone(descriptor),
            label_values: label_values
                .iter()
                .map(|v| v.as_ref().to_string())
                .collect(),
            value,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> MetricKind {
        self.descriptor.kind
    }

    pub fn help(&self) -> &str {
        &self.descriptor.help
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn descriptor(&self) -> &Arc<MetricDescriptor> {
        &self.descriptor
    }

    /// Iterate over `(label name, label value)` pairs in declaration order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.descriptor
            .label_names
            .iter()
            .map(String::as_str)
            .zip(self.label_values.iter().map(String::as_str))
    }

    /// Look up a single label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels().find(|(k, _)| *k == name).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_creation() {
        let desc = MetricDescriptor::gauge(
            "rabbitmq_queue_messages_ready",
            "Messages ready to be delivered",
            &["vhost", "queue"],
        );
        let sample = MetricSample::new(&desc, &["/", "orders"], 12.0).unwrap();

        assert_eq!(sample.name(), "rabbitmq_queue_messages_ready");
        assert_eq!(sample.kind(), MetricKind::Gauge);
        assert_eq!(sample.value(), 12.0);
        assert_eq!(
            sample.labels().collect::<Vec<_>>(),
            vec![("vhost", "/"), ("queue", "orders")]
        );
        assert_eq!(sample.label("queue"), Some("orders"));
        assert_eq!(sample.label("node"), None);
    }

    #[test]
    fn test_sample_label_arity() {
        let desc = MetricDescriptor::counter("rabbitmq_published_total", "Published", &["vhost"]);

        let err = MetricSample::new::<&str>(&desc, &[], 1.0).unwrap_err();
        assert_eq!(
            err,
            MetricError::LabelArity {
                name: "rabbitmq_published_total".to_string(),
                expected: 1,
                actual: 0,
            }
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MetricKind::Counter.to_string(), "counter");
        assert_eq!(MetricKind::Gauge.as_str(), "gauge");
    }
}
