//! Prometheus exporter for RabbitMQ.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use rabbitsight_exporter::{
    Capability, ExporterConfig, ExporterEnv, ExporterRegistry, HttpServer, ScrapeCollector,
    UpstreamClient, WireFormat,
};

/// Prometheus exporter for RabbitMQ.
#[derive(Parser, Debug)]
#[command(name = "rabbitsight-exporter")]
#[command(about = "Export RabbitMQ management statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

async fn wait_for_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "Ctrl+C").map_err(Into::into),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };
    config.apply_env()?;

    let mut settings = config.resolve()?;

    // CLI overrides
    if let Some(listen) = args.listen {
        settings.listen = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", listen, e))?;
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }

    rabbitsight_common::init_tracing(&settings.logging)?;

    info!(
        rabbit_url = %settings.rabbit_url,
        capabilities = %settings.capabilities,
        timeout_secs = settings.timeout.as_secs(),
        "Starting RabbitSight exporter"
    );

    let format = if settings.capabilities.contains(Capability::Bert) {
        WireFormat::Bert
    } else {
        WireFormat::Json
    };
    let broker = UpstreamClient::builder(settings.rabbit_url.clone())
        .credentials(settings.credentials.clone())
        .format(format)
        .timeout(settings.timeout)
        .tls(settings.tls.clone())
        .build()?;

    let settings = Arc::new(settings);
    let env = ExporterEnv {
        settings: Arc::clone(&settings),
        broker: Arc::new(broker),
    };

    let registry = ExporterRegistry::builtin();
    let exporters = registry.build_active(&settings.enabled_exporters, &env)?;

    let collector = Arc::new(ScrapeCollector::new(
        exporters,
        settings.timeout,
        settings.exclude_metrics.clone(),
    ));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        Arc::clone(&collector),
        settings.listen,
        settings.metrics_path.clone(),
    );

    // Start HTTP server
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    let signal = wait_for_signal().await?;
    info!("Received {}, shutting down...", signal);

    // Signal shutdown
    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    // Print final stats
    let stats = collector.stats();
    info!(
        scrapes = stats.scrapes,
        module_failures = stats.module_failures,
        module_timeouts = stats.module_timeouts,
        samples_collected = stats.samples_collected,
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
