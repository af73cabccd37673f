mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use lanline_relay::{config::Config, serve, AppState};

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    // Check if running as probe client
    if let Some(Commands::Probe {
        url,
        user,
        name,
        to,
    }) = cli.command.clone()
    {
        return cli::run_probe(url, user, name, to).await;
    }

    let config = cli.apply(Config::from_env());
    info!(
        port = config.port,
        token_required = config.jwt_secret.is_some(),
        idle_timeout_secs = config.idle_timeout_seconds,
        "starting lanline relay"
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    let state = AppState::new(&config, Some(metrics_handle));
    state
        .relay
        .spawn_heartbeat_monitor(config.heartbeat_scan_interval(), config.idle_timeout());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "lanline relay listening");

    serve(listener, state).await.context("relay server failed")
}
