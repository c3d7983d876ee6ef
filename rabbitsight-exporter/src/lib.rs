//! Prometheus exporter for RabbitMQ.
//!
//! Every request to the metrics endpoint triggers one scrape: the active
//! exporters poll the RabbitMQ management API (and optionally a Prometheus
//! query API) concurrently, under a shared deadline, and the collected
//! samples are rendered in the text exposition format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ Management API  │────>│    Exporters    │────>│    Collector    │
//! │ Prometheus API  │     │ (per scrape)    │     │   (deadline)    │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//!                                                 ┌────────▼────────┐
//!                                                 │   HTTP Server   │
//!                                                 │   (/metrics)    │
//!                                                 └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! rabbitsight-exporter --config config.json5
//! ```
//!
//! Every setting can also be given through the environment (`RABBIT_URL`,
//! `RABBIT_EXPORTERS`, ...). See [`config::ExporterConfig`].

pub mod bert;
pub mod capability;
pub mod client;
pub mod collector;
pub mod config;
pub mod exporters;
pub mod exposition;
pub mod filter;
pub mod http;
pub mod registry;
pub mod scrape;

#[cfg(test)]
mod testing;

pub use capability::{Capability, CapabilitySet};
pub use client::{ClientError, UpstreamClient, WireFormat};
pub use collector::{ScrapeCollector, ScrapeOutcome, SharedCollector};
pub use config::{ConfigError, ExporterConfig, Settings};
pub use exporters::{Exporter, ExporterEnv, ExporterError};
pub use filter::{EntityClass, EntityFilter};
pub use http::HttpServer;
pub use registry::ExporterRegistry;
pub use scrape::ScrapeContext;
