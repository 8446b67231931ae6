mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use libgc::metrics::register_metrics;
use libgc::{GarbageCollector, StaticResolver, XlineStore, load_config};
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .target(env_logger::Target::Stdout)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, workers } => {
            let cfg = load_config(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            init_metrics(cfg.metrics_addr)?;

            let store = Arc::new(
                XlineStore::new(&cfg.xline_config)
                    .await
                    .context("failed to connect to xline")?,
            );
            let mut resolver = StaticResolver::with_defaults();
            resolver.register_entries(&cfg.gc.resources);

            let gc = Arc::new(GarbageCollector::new(store, Arc::new(resolver), &cfg.gc));
            let workers = workers.unwrap_or(cfg.gc.workers);
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(gc.run(workers, cancel.clone()));
            info!("[rkgc] started with {workers} workers");

            if let Err(e) = signal::ctrl_c().await {
                error!("failed to listen for ctrl_c: {e:?}");
            }
            info!("[rkgc] shutting down");
            cancel.cancel();
            handle.await.context("collector task failed")?;
        }
    }

    Ok(())
}

/// Installs the Prometheus exporter before any collector metric is
/// recorded, then describes the collector metrics.
fn init_metrics(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    match addr {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("failed to install prometheus exporter")?;
            info!("[rkgc] serving metrics on http://{addr}/metrics");
        }
        None => info!("[rkgc] metrics exporter disabled"),
    }
    register_metrics();
    Ok(())
}
