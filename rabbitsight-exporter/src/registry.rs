//! Ordered registry of exporter constructors.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ConfigError;
use crate::exporters::{
    AlivenessExporter, CpuExporter, ExchangeExporter, Exporter, ExporterEnv, NodeExporter,
    OverviewExporter, QueueExporter,
};

/// Builds an exporter from the resolved settings.
pub type ExporterConstructor = fn(&ExporterEnv) -> Result<Box<dyn Exporter>, ConfigError>;

/// Name to constructor mapping, populated at startup only.
#[derive(Default)]
pub struct ExporterRegistry {
    entries: Vec<(&'static str, ExporterConstructor)>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in exporter.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let builtins: [(&'static str, ExporterConstructor); 6] = [
            (OverviewExporter::NAME, OverviewExporter::build),
            (NodeExporter::NAME, NodeExporter::build),
            (QueueExporter::NAME, QueueExporter::build),
            (ExchangeExporter::NAME, ExchangeExporter::build),
            (AlivenessExporter::NAME, AlivenessExporter::build),
            (CpuExporter::NAME, CpuExporter::build),
        ];
        for (name, ctor) in builtins {
            registry
                .register(name, ctor)
                .expect("built-in exporter names are distinct");
        }
        registry
    }

    /// Add an entry. Registering a name twice is a configuration error.
    pub fn register(
        &mut self,
        name: &'static str,
        constructor: ExporterConstructor,
    ) -> Result<(), ConfigError> {
        if self.contains(name) {
            return Err(ConfigError::DuplicateExporter(name.to_string()));
        }
        self.entries.push((name, constructor));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| *n == name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(n, _)| *n).collect()
    }

    /// Construct the enabled exporters, in the order they are listed.
    ///
    /// Fails on the first unknown name or failing constructor. Repeated names
    /// are built once. Exporters whose upstream is not configured
    /// ([`ConfigError::Unavailable`]) are skipped with a warning.
    pub fn build_active(
        &self,
        enabled: &[String],
        env: &ExporterEnv,
    ) -> Result<Vec<Arc<dyn Exporter>>, ConfigError> {
        let mut seen = HashSet::new();
        let mut active: Vec<Arc<dyn Exporter>> = Vec::with_capacity(enabled.len());

        for name in enabled {
            let name = name.trim();
            let Some((_, constructor)) = self.entries.iter().find(|(n, _)| *n == name) else {
                return Err(ConfigError::UnknownExporter(name.to_string()));
            };
            if !seen.insert(name) {
                warn!(exporter = name, "Exporter enabled more than once, ignoring repeat");
                continue;
            }
            match constructor(env) {
                Ok(exporter) => active.push(Arc::from(exporter)),
                Err(ConfigError::Unavailable { exporter, reason }) => {
                    warn!(exporter, reason = %reason, "Exporter unavailable, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            exporters = ?active.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "Exporters enabled"
        );
        Ok(active)
    }
}
