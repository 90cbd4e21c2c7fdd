//! Keep exactly one replica active and rotate it across the fleet.
mod cli;

use crate::cli::configure_cli;
use env_logger::Env;
use futures_util::future::join_all;
use log::{error, info};
use shifter::config::load_config;
use shifter::docker::DockerProxy;
use shifter::fleet::Fleet;
use shifter::replica::ReplicaClient;
use shifter::retry::RetryPolicy;
use shifter::rotation::RotationEngine;
use shifter::runner::{Shutdown, spawn_loops};
use shifter::security::SecurityMonitor;
use shifter::server::{AppState, start_server};
use shifter::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = configure_cli();
    let config = load_config(args.config.as_deref())?;
    let names = config.container_names()?;
    info!("Starting shifter, managing {names:?}");

    let proxy = DockerProxy::new(
        config.proxy_url.as_str(),
        config.proxy_token.clone(),
        names.clone(),
        Duration::from_secs(config.proxy_timeout),
    )?;
    let replicas = Arc::new(ReplicaClient::new(
        config.replica_url.as_str(),
        config.replica_token.clone(),
        Duration::from_secs(config.prepare_timeout),
        Duration::from_secs(config.metrics_timeout),
    )?);
    let fleet = Arc::new(Fleet::new(Arc::new(proxy), names, RetryPolicy::default()));
    let security = SecurityMonitor::new(
        replicas.clone(),
        Duration::from_secs(config.security_cache_ttl),
    );
    let engine = Arc::new(RotationEngine::new(
        fleet,
        replicas,
        security,
        Telemetry::new(config.telemetry_settings()),
        config.rotation_settings(),
    ));

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, gracefully shutting down...");
        signal.trigger();
    })?;

    let tasks = spawn_loops(engine.clone(), config.loop_intervals(), shutdown.clone());

    let state = AppState {
        control: engine,
        api_secret: config.api_secret.clone(),
        sse_interval: Duration::from_secs(config.snapshot_refresh_interval),
    };
    let port = args.port.unwrap_or(config.listen_port);
    let server_shutdown = shutdown.clone();
    if let Err(e) = start_server(state, port, async move { server_shutdown.wait().await }).await
    {
        error!("Control API failed: {e}");
        shutdown.trigger();
    }

    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!("background task ended abnormally: {e}");
        }
    }
    info!("Shutdown complete");
    Ok(())
}
