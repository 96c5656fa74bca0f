//! GPU telemetry exporter.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use opentelemetry::metrics::MeterProvider as _;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use gpusight_common::init_tracing;
use gpusight_exporter::otel::{METER_NAME, init_meter_provider, shutdown_meter_provider};
use gpusight_exporter::{
    ExporterConfig, HttpServer, MeterEmitter, MetricsStore, build_simulated_pipeline,
};

/// GPU telemetry exporter.
#[derive(Parser, Debug)]
#[command(name = "gpusight-exporter")]
#[command(about = "Export GPU telemetry as Prometheus and OpenTelemetry metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    log_level: Option<String>,
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

    // Override listen address from CLI
    if let Some(listen) = args.listen {
        config.http.listen = listen;
        config.validate()?;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    info!("Starting GpuSight exporter");

    let hostname = config.resolve_hostname();
    info!(hostname = ?hostname, "Resolved hostname");

    let listen_addr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Optional OTLP push
    let meter_provider = if config.opentelemetry.enabled {
        Some(init_meter_provider(&config.opentelemetry)?)
    } else {
        None
    };
    let emitter = meter_provider
        .as_ref()
        .map(|provider| MeterEmitter::new(&provider.meter(METER_NAME), &config.counters));

    let pipeline = build_simulated_pipeline(&config, hostname, emitter, None)?;

    // Create shutdown signal and pipeline output
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (output_tx, output_rx) = mpsc::channel(config.pipeline.output_capacity);

    // The pipeline runs its blocking collection cycles on a dedicated thread
    let pipeline_shutdown = shutdown_rx.clone();
    let pipeline_thread = std::thread::Builder::new()
        .name("gpusight-pipeline".to_string())
        .spawn(move || -> anyhow::Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            runtime.block_on(pipeline.run(output_tx, pipeline_shutdown));
            Ok(())
        })?;

    let store = Arc::new(MetricsStore::new());
    let feed_task = tokio::spawn(store.clone().consume(output_rx));

    // Start HTTP server
    let http_server = HttpServer::new(store.clone(), listen_addr, config.http.path.clone());
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // The pipeline exits between cycles; its output channel closes with it
    match tokio::task::spawn_blocking(move || pipeline_thread.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Pipeline error: {}", e),
        Ok(Err(_)) => error!("Pipeline thread panicked"),
        Err(e) => error!("Failed to join pipeline thread: {}", e),
    }

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = feed_task.await;
        let _ = http_task.await;
    })
    .await;

    if let Some(provider) = &meter_provider {
        shutdown_meter_provider(provider);
    }

    info!(
        payloads_received = store.payloads_received(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
