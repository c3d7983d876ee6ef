//! Per-scrape state handed to every exporter.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rabbitsight_common::{MetricDescriptor, MetricError, MetricSample};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Write end of the per-scrape sample channel.
///
/// Excluded families are dropped here. Writes after the deadline or after
/// the orchestrator stopped listening are discarded.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: mpsc::UnboundedSender<MetricSample>,
    excluded: Arc<HashSet<String>>,
    deadline: Instant,
}

impl MetricSink {
    /// Returns whether the sample was handed to the orchestrator.
    pub fn push(&self, sample: MetricSample) -> bool {
        if self.excluded.contains(sample.name()) {
            return false;
        }
        if Instant::now() >= self.deadline {
            trace!(metric = sample.name(), "Discarding sample written after deadline");
            return false;
        }
        if self.tx.send(sample).is_err() {
            trace!("Discarding sample, scrape already finished");
            return false;
        }
        true
    }
}

/// Deadline and output channel for one scrape.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    sink: MetricSink,
}

impl ScrapeContext {
    pub fn new(
        tx: mpsc::UnboundedSender<MetricSample>,
        excluded: Arc<HashSet<String>>,
        deadline: Instant,
    ) -> Self {
        Self {
            sink: MetricSink {
                tx,
                excluded,
                deadline,
            },
        }
    }

    /// A context with its receiving end, expiring `timeout` from now.
    pub fn channel(
        timeout: Duration,
        excluded: Arc<HashSet<String>>,
    ) -> (Self, mpsc::UnboundedReceiver<MetricSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, excluded, Instant::now() + timeout), rx)
    }

    pub fn deadline(&self) -> Instant {
        self.sink.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.sink.deadline
    }

    pub fn sink(&self) -> &MetricSink {
        &self.sink
    }

    pub fn push(&self, sample: MetricSample) -> bool {
        self.sink.push(sample)
    }

    /// Build a sample for `descriptor` and push it.
    pub fn emit<S: AsRef<str>>(
        &self,
        descriptor: &Arc<MetricDescriptor>,
        labels: &[S],
        value: f64,
    ) -> Result<bool, MetricError> {
        let sample = MetricSample::new(descriptor, labels, value)?;
        Ok(self.push(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_messages() -> Arc<MetricDescriptor> {
        MetricDescriptor::gauge("rabbitmq_queue_messages", "Messages in queue", &["queue"])
    }

    #[tokio::test]
    async fn test_emit_delivers() {
        let (ctx, mut rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());

        assert!(ctx.emit(&queue_messages(), &["orders"], 3.0).unwrap());
        drop(ctx);

        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.name(), "rabbitmq_queue_messages");
        assert_eq!(sample.label("queue"), Some("orders"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_excluded_family_dropped() {
        let excluded: HashSet<String> = ["rabbitmq_queue_messages".to_string()].into();
        let (ctx, mut rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::new(excluded));

        assert!(!ctx.emit(&queue_messages(), &["orders"], 3.0).unwrap());
        drop(ctx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_label_arity_checked() {
        let (ctx, _rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());
        assert!(ctx.emit(&queue_messages(), &["a", "b"], 1.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_write_discarded() {
        let (ctx, mut rx) = ScrapeContext::channel(Duration::from_secs(1), Arc::default());
        assert!(!ctx.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ctx.is_expired());
        assert!(!ctx.emit(&queue_messages(), &["orders"], 1.0).unwrap());

        drop(ctx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (ctx, rx) = ScrapeContext::channel(Duration::from_secs(5), Arc::default());
        drop(rx);
        assert!(!ctx.emit(&queue_messages(), &["orders"], 1.0).unwrap());
    }
}
