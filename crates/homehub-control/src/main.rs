use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use homehub_agent::{HubConfig, LifecycleManager};
use homehub_control::{api, state::AppState, telemetry};

const DEFAULT_CONFIG: &str = "config.yaml";
const DEFAULT_BIND: &str = "0.0.0.0:8000";

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("HOMEHUB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG));
    let config = HubConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let log_dir = std::env::var("HOMEHUB_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.hub.logs_dir.clone());
    let _log_guard = telemetry::init(&log_dir)?;

    let bind = std::env::var("HOMEHUB_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid HOMEHUB_BIND `{bind}`"))?;

    config.warn_on_shared_ports();
    tracing::info!(
        config = %config_path.display(),
        apps = config.apps.len(),
        hub = %config.hub.name,
        "config loaded"
    );

    let state = AppState::new(LifecycleManager::new(config));
    let scheduler = state.scheduler.spawn();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "homehub HTTP listening");

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Managed apps keep running; the next hub start adopts them from their
    // pid files.
    scheduler.shutdown().await;
    served.context("http server")?;
    Ok(())
}
