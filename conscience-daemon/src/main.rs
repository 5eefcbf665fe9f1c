#![forbid(unsafe_code)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use conscience_core::ConscienceConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use conscience_daemon::persistence;
use conscience_daemon::server::{build_state, ensure_token_from_env_or_cookie, serve};

const EXPIRY_SWEEP_SECS: u64 = 1;

#[tokio::main(worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    // tracing init (env controlled)
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    // Config file: positional argument wins over CONSCIENCE_CONFIG.
    let config_path: Option<PathBuf> = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONSCIENCE_CONFIG").ok())
        .map(PathBuf::from);
    let config = match &config_path {
        Some(path) => ConscienceConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ConscienceConfig::from_env().context("loading config from environment")?,
    };
    if let Some(level) = &config.log_level {
        std::env::set_var("RUST_LOG", level);
    }

    let namespace = config.namespace.clone();
    let listen_addr = config.listen_addr.clone();
    let persistence_path = config.persistence_path.clone();
    let token = ensure_token_from_env_or_cookie();
    let state = build_state(config, config_path, token)?;

    info!("starting conscience-daemon for namespace {namespace:?} at {listen_addr}");

    // Recover the previous registry content, if any. A missing or malformed
    // status file is a warning, not a startup failure.
    if let Some(path) = &persistence_path {
        match persistence::restart_srv_from_file(&state.registry, &namespace, path).await {
            Ok(n) => {
                state.metrics.record_restore(n);
                info!("restored {n} service(s) from {}", path.display());
            }
            Err(e) => warn!("no registry restored: {e}"),
        }
    }

    let _expiry = state
        .registry
        .start_expiry_loop(Duration::from_secs(EXPIRY_SWEEP_SECS));

    let _persist = match &persistence_path {
        Some(path) => Some(persistence::start_persistence_loop(
            Arc::clone(&state.registry),
            namespace.clone(),
            path.clone(),
            state.cfg.clone(),
            state.events.sender(),
            Arc::clone(&state.metrics),
        )),
        None => {
            info!("persistence disabled (no persistence_path)");
            None
        }
    };

    // Optional Prometheus exporter, env-driven like the rest of the telemetry.
    if let Some((_srv, addr, _coll)) = conscience_daemon::prometheus_exporter::maybe_start_from_env(
        Arc::clone(&state.metrics),
        Arc::clone(&state.registry),
    )
    .await
    {
        info!("prometheus exporter listening at http://{addr}/metrics");
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;

    tokio::select! {
        res = serve(listener, Arc::clone(&state)) => {
            res.context("rpc server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    // Final snapshot on clean shutdown so a restart starts from fresh state.
    if let Some(path) = &persistence_path {
        match persistence::write_status(&state.registry, &namespace, path).await {
            Ok(n) => info!("final status written: {n} service(s)"),
            Err(e) => warn!("final status write failed: {e}"),
        }
    }
    Ok(())
}
