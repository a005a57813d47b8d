// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use model_dl::config::Config;
use model_dl::prelude::*;
use model_dl::server;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::parse();
    cfg.validate()?;

    let shutdown = CancellationToken::new();
    let store = JobStore::shared();
    let queue = WorkerQueue::new(cfg.max_concurrent_downloads);

    let history = match &cfg.history_db {
        Some(path) => Some(
            StateManager::new(path)
                .await
                .with_context(|| format!("failed to open history database {}", path.display()))?,
        ),
        None => None,
    };

    let settings = cfg.manager_settings()?;
    tokio::fs::create_dir_all(&settings.models_dir)
        .await
        .with_context(|| format!("failed to create {}", settings.models_dir.display()))?;
    info!(
        models_dir = %settings.models_dir.display(),
        concurrent = cfg.max_concurrent_downloads,
        "download manager ready"
    );

    let mut broadcaster = ProgressBroadcaster::new(store.clone(), cfg.progress_interval());
    if let Some(history) = &history {
        broadcaster = broadcaster.with_history(history.clone());
    }
    let manager = Arc::new(JobManager::new(
        store,
        queue,
        settings,
        history,
        shutdown.clone(),
    )?);
    let state = AppState::new(manager, broadcaster, shutdown.clone());

    let addr = cfg.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API on {}", listener.local_addr()?);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down, cancelling in-flight downloads");
        trigger.cancel();
    });

    server::serve(listener, state, shutdown.cancelled_owned())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
