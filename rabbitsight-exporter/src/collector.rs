//! Scrape orchestration: runs every active exporter concurrently under a
//! shared deadline and gathers their samples.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use rabbitsight_common::{MetricDescriptor, MetricSample};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::exporters::Exporter;
use crate::scrape::ScrapeContext;

/// How an exporter ended for one scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Success,
    Failed(String),
    /// Still running at the deadline; its task was aborted.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleReport {
    pub module: &'static str,
    pub status: ModuleStatus,
    pub duration: Duration,
}

impl ModuleReport {
    pub fn is_up(&self) -> bool {
        self.status == ModuleStatus::Success
    }
}

/// Result of one scrape. Never an error: failures are reported per module.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub samples: Vec<MetricSample>,
    pub reports: Vec<ModuleReport>,
    pub duration: Duration,
}

impl ScrapeOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &ModuleReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.status, ModuleStatus::Failed(_)))
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &ModuleReport> {
        self.reports
            .iter()
            .filter(|r| r.status == ModuleStatus::TimedOut)
    }

    /// True when at least one exporter succeeded.
    pub fn is_up(&self) -> bool {
        self.reports.iter().any(ModuleReport::is_up)
    }
}

/// Process-lifetime counters of the exporter itself.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    pub scrapes: u64,
    pub module_failures: u64,
    pub module_timeouts: u64,
    pub samples_collected: u64,
}

struct SelfMetrics {
    up: Arc<MetricDescriptor>,
    module_up: Arc<MetricDescriptor>,
    module_duration: Arc<MetricDescriptor>,
    scrapes_total: Arc<MetricDescriptor>,
    failures_total: Arc<MetricDescriptor>,
}

impl SelfMetrics {
    fn new() -> Self {
        Self {
            up: MetricDescriptor::gauge(
                "rabbitmq_up",
                "Was the last scrape of rabbitmq successful.",
                &[],
            ),
            module_up: MetricDescriptor::gauge(
                "rabbitmq_module_up",
                "Was the last scrape of the exporter module successful.",
                &["module"],
            ),
            module_duration: MetricDescriptor::gauge(
                "rabbitmq_module_scrape_duration_seconds",
                "Duration of the last scrape of the exporter module.",
                &["module"],
            ),
            scrapes_total: MetricDescriptor::counter(
                "rabbitmq_exporter_scrapes_total",
                "Total scrapes served by the exporter.",
                &[],
            ),
            failures_total: MetricDescriptor::counter(
                "rabbitmq_exporter_module_failures_total",
                "Total failed or timed out exporter module runs.",
                &[],
            ),
        }
    }

    fn all(&self) -> [Arc<MetricDescriptor>; 5] {
        [
            Arc::clone(&self.up),
            Arc::clone(&self.module_up),
            Arc::clone(&self.module_duration),
            Arc::clone(&self.scrapes_total),
            Arc::clone(&self.failures_total),
        ]
    }
}

/// Thread-safe scrape orchestrator.
pub struct ScrapeCollector {
    exporters: Vec<Arc<dyn Exporter>>,
    timeout: Duration,
    excluded: Arc<HashSet<String>>,
    self_metrics: SelfMetrics,
    stats: RwLock<CollectorStats>,
}

type TaskResult = (usize, Result<(), String>, Duration);

impl ScrapeCollector {
    pub fn new(
        exporters: Vec<Arc<dyn Exporter>>,
        timeout: Duration,
        excluded: HashSet<String>,
    ) -> Self {
        Self {
            exporters,
            timeout,
            excluded: Arc::new(excluded),
            self_metrics: SelfMetrics::new(),
            stats: RwLock::new(CollectorStats::default()),
        }
    }

    pub fn exporter_names(&self) -> Vec<&'static str> {
        self.exporters.iter().map(|e| e.name()).collect()
    }

    /// Every family that a scrape may produce.
    pub fn descriptors(&self) -> Vec<Arc<MetricDescriptor>> {
        self.exporters
            .iter()
            .flat_map(|e| e.describe())
            .chain(self.self_metrics.all())
            .collect()
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats.read().clone()
    }

    /// Run one scrape.
    pub async fn scrape(&self) -> ScrapeOutcome {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ScrapeContext::new(tx, Arc::clone(&self.excluded), deadline);

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        for (index, exporter) in self.exporters.iter().enumerate() {
            let exporter = Arc::clone(exporter);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let begun = Instant::now();
                let result = match AssertUnwindSafe(exporter.collect(&ctx)).catch_unwind().await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err("exporter panicked".to_string()),
                };
                (index, result, begun.elapsed())
            });
        }
        drop(ctx);

        let mut samples = Vec::new();
        let mut results: Vec<Option<(ModuleStatus, Duration)>> = vec![None; self.exporters.len()];
        let mut pending = self.exporters.len();

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        while pending > 0 {
            tokio::select! {
                biased;

                Some(sample) = rx.recv() => samples.push(sample),

                joined = tasks.join_next() => match joined {
                    Some(Ok((index, result, elapsed))) => {
                        pending -= 1;
                        let status = match result {
                            Ok(()) => ModuleStatus::Success,
                            Err(e) => ModuleStatus::Failed(e),
                        };
                        results[index] = Some((status, elapsed));
                    }
                    Some(Err(e)) => {
                        // Only reachable through cancellation.
                        warn!(error = %e, "Exporter task ended abnormally");
                        pending -= 1;
                    }
                    None => pending = 0,
                },

                _ = &mut sleep => {
                    trace!(pending, "Scrape deadline reached");
                    break;
                }
            }
        }

        tasks.abort_all();
        rx.close();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }

        let reports: Vec<ModuleReport> = self
            .exporters
            .iter()
            .zip(results)
            .map(|(exporter, result)| {
                let (status, duration) = result.unwrap_or((ModuleStatus::TimedOut, self.timeout));
                ModuleReport {
                    module: exporter.name(),
                    status,
                    duration,
                }
            })
            .collect();

        for report in &reports {
            match &report.status {
                ModuleStatus::Success => {}
                ModuleStatus::Failed(error) => {
                    warn!(module = report.module, error = %error, "Exporter failed")
                }
                ModuleStatus::TimedOut => warn!(
                    module = report.module,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Exporter did not finish before the scrape deadline"
                ),
            }
        }

        let mut outcome = ScrapeOutcome {
            samples,
            reports,
            duration: started.elapsed(),
        };
        self.record(&mut outcome);

        debug!(
            samples = outcome.samples.len(),
            failed = outcome.failures().count(),
            timed_out = outcome.timed_out().count(),
            duration_ms = outcome.duration.as_millis() as u64,
            "Scrape completed"
        );

        outcome
    }

    /// Update the process counters and append the self metrics.
    fn record(&self, outcome: &mut ScrapeOutcome) {
        let collected = outcome.samples.len() as u64;
        let stats = {
            let mut stats = self.stats.write();
            stats.scrapes += 1;
            stats.module_failures += outcome.failures().count() as u64;
            stats.module_timeouts += outcome.timed_out().count() as u64;
            stats.samples_collected += collected;
            stats.clone()
        };

        let m = &self.self_metrics;
        let no_labels: &[&str] = &[];
        let mut extra = Vec::with_capacity(3 + outcome.reports.len() * 2);

        extra.push(MetricSample::new(&m.up, no_labels, if outcome.is_up() { 1.0 } else { 0.0 }));
        for report in &outcome.reports {
            let labels = [report.module];
            extra.push(MetricSample::new(
                &m.module_up,
                &labels,
                if report.is_up() { 1.0 } else { 0.0 },
            ));
            extra.push(MetricSample::new(
                &m.module_duration,
                &labels,
                report.duration.as_secs_f64(),
            ));
        }
        extra.push(MetricSample::new(&m.scrapes_total, no_labels, stats.scrapes as f64));
        extra.push(MetricSample::new(
            &m.failures_total,
            no_labels,
            (stats.module_failures + stats.module_timeouts) as f64,
        ));

        for sample in extra {
            match sample {
                Ok(s) if !self.excluded.contains(s.name()) => outcome.samples.push(s),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to build self metric"),
            }
        }
    }
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<ScrapeCollector>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::ExporterError;
    use async_trait::async_trait;

    /// Emits `count` samples, then optionally fails or stalls.
    struct FakeExporter {
        name: &'static str,
        count: usize,
        outcome: Outcome,
        descriptor: Arc<MetricDescriptor>,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Ok,
        Fail,
        Stall,
        Panic,
    }

    impl FakeExporter {
        fn new(name: &'static str, count: usize, outcome: Outcome) -> Arc<dyn Exporter> {
            Arc::new(Self {
                name,
                count,
                outcome,
                descriptor: MetricDescriptor::gauge(
                    format!("test_{}_value", name),
                    "Test value.",
                    &["index"],
                ),
            })
        }
    }

    #[async_trait]
    impl Exporter for FakeExporter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
            vec![Arc::clone(&self.descriptor)]
        }

        async fn collect(&self, ctx: &ScrapeContext) -> Result<(), ExporterError> {
            for i in 0..self.count {
                ctx.emit(&self.descriptor, &[i.to_string()], i as f64)?;
            }
            match self.outcome {
                Outcome::Ok => Ok(()),
                Outcome::Fail => Err(ExporterError::Upstream("broker unavailable".to_string())),
                Outcome::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Outcome::Panic => panic!("exporter bug"),
            }
        }
    }

    fn collector(exporters: Vec<Arc<dyn Exporter>>) -> ScrapeCollector {
        ScrapeCollector::new(exporters, Duration::from_secs(5), HashSet::new())
    }

    fn family<'a>(outcome: &'a ScrapeOutcome, name: &str) -> Vec<&'a MetricSample> {
        outcome.samples.iter().filter(|s| s.name() == name).collect()
    }

    fn module_up(outcome: &ScrapeOutcome, module: &str) -> Option<f64> {
        family(outcome, "rabbitmq_module_up")
            .into_iter()
            .find(|s| s.label("module") == Some(module))
            .map(|s| s.value())
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let collector = collector(vec![
            FakeExporter::new("a", 3, Outcome::Ok),
            FakeExporter::new("b", 0, Outcome::Fail),
        ]);

        let outcome = collector.scrape().await;

        assert_eq!(family(&outcome, "test_a_value").len(), 3);
        let failures: Vec<_> = outcome.failures().map(|r| r.module).collect();
        assert_eq!(failures, vec!["b"]);
        assert!(outcome.is_up());
        assert_eq!(module_up(&outcome, "a"), Some(1.0));
        assert_eq!(module_up(&outcome, "b"), Some(0.0));
        assert_eq!(family(&outcome, "rabbitmq_up")[0].value(), 1.0);
        assert_eq!(collector.stats().module_failures, 1);
    }

    #[tokio::test]
    async fn test_samples_before_failure_kept() {
        let collector = collector(vec![FakeExporter::new("a", 2, Outcome::Fail)]);
        let outcome = collector.scrape().await;

        assert_eq!(family(&outcome, "test_a_value").len(), 2);
        assert!(!outcome.is_up());
        assert_eq!(family(&outcome, "rabbitmq_up")[0].value(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_partial_results() {
        let collector = ScrapeCollector::new(
            vec![
                FakeExporter::new("fast", 1, Outcome::Ok),
                FakeExporter::new("slow", 2, Outcome::Stall),
            ],
            Duration::from_secs(1),
            HashSet::new(),
        );

        let outcome = collector.scrape().await;

        assert_eq!(family(&outcome, "test_fast_value").len(), 1);
        assert_eq!(family(&outcome, "test_slow_value").len(), 2);
        let timed_out: Vec<_> = outcome.timed_out().map(|r| r.module).collect();
        assert_eq!(timed_out, vec!["slow"]);
        assert_eq!(module_up(&outcome, "slow"), Some(0.0));
        assert!(outcome.is_up());
        assert_eq!(collector.stats().module_timeouts, 1);
    }

    #[tokio::test]
    async fn test_panic_is_failure() {
        let collector = collector(vec![
            FakeExporter::new("ok", 1, Outcome::Ok),
            FakeExporter::new("buggy", 0, Outcome::Panic),
        ]);
        let outcome = collector.scrape().await;

        let failures: Vec<_> = outcome.failures().map(|r| r.module).collect();
        assert_eq!(failures, vec!["buggy"]);
        assert_eq!(family(&outcome, "test_ok_value").len(), 1);
    }

    #[tokio::test]
    async fn test_no_state_between_scrapes() {
        let collector = collector(vec![FakeExporter::new("a", 2, Outcome::Ok)]);

        let first = collector.scrape().await;
        let second = collector.scrape().await;

        assert_eq!(family(&first, "test_a_value").len(), 2);
        assert_eq!(family(&second, "test_a_value").len(), 2);
        assert_eq!(family(&second, "rabbitmq_exporter_scrapes_total")[0].value(), 2.0);
    }

    #[tokio::test]
    async fn test_excluded_families() {
        let excluded: HashSet<String> = ["test_a_value", "rabbitmq_module_scrape_duration_seconds"]
            .into_iter()
            .map(String::from)
            .collect();
        let collector = ScrapeCollector::new(
            vec![FakeExporter::new("a", 2, Outcome::Ok)],
            Duration::from_secs(5),
            excluded,
        );

        let outcome = collector.scrape().await;
        assert!(family(&outcome, "test_a_value").is_empty());
        assert!(family(&outcome, "rabbitmq_module_scrape_duration_seconds").is_empty());
        assert_eq!(module_up(&outcome, "a"), Some(1.0));
    }

    #[tokio::test]
    async fn test_no_exporters() {
        let collector = collector(Vec::new());
        let outcome = collector.scrape().await;
        assert!(!outcome.is_up());
        assert_eq!(family(&outcome, "rabbitmq_up")[0].value(), 0.0);
    }

    #[test]
    fn test_descriptors() {
        let collector = collector(vec![FakeExporter::new("a", 0, Outcome::Ok)]);
        let names: Vec<String> = collector.descriptors().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names.len(), 6);
        assert_eq!(names[0], "test_a_value");
        assert!(names.contains(&"rabbitmq_up".to_string()));
        assert_eq!(collector.exporter_names(), vec!["a"]);
    }
}
