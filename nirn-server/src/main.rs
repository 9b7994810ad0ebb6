//! nirn-proxy server.
//!
//! Wires the proxy core to the outside world: environment configuration,
//! logging, the metrics exporter, the client-facing HTTP listener, and the
//! cluster gossip lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nirn_core::proxy::{
    build_router, AppState, ClusterMembership, ClusterRouter, DiscordClient, GlobalRateLimiter,
    QueueDeps, QueueRegistry,
};
use nirn_core::{logging, metrics, Config};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    logging::init(&config.log_level);

    if config.enable_metrics {
        let addr = SocketAddr::new(config.bind_ip, config.metrics_port);
        metrics::install(addr).context("failed to start metrics exporter")?;
        tracing::info!(%addr, "started metrics server");
    }
    if config.enable_pprof {
        tracing::warn!("ENABLE_PPROF is set but profiling endpoints are not supported");
    }

    let client = Arc::new(DiscordClient::new(&config).context("failed to build http client")?);
    let global = Arc::new(GlobalRateLimiter::new());
    let router = Arc::new(ClusterRouter::new());
    let registry = Arc::new(QueueRegistry::new(QueueDeps {
        client: client.clone(),
        global: global.clone(),
        router: router.clone(),
        config: config.clone(),
    }));

    let state = AppState {
        registry,
        global,
        router: router.clone(),
        client,
        config: config.clone(),
    };

    let app = build_router(state);
    let listen_addr = SocketAddr::new(config.bind_ip, config.port);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;

    tracing::info!(%listen_addr, "started proxy");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Give the HTTP listener a moment to come up before advertising
    // ourselves to the cluster.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let membership = if config.cluster_enabled() {
        tracing::info!("attempting to create/join cluster");
        match ClusterMembership::join(&config, router).await {
            Ok(membership) => Some(membership),
            Err(err) => {
                // A node that cannot gossip still works; it just processes
                // everything locally.
                tracing::error!(error = %err, "failed to join cluster, proceeding stand-alone");
                None
            }
        }
    } else {
        tracing::info!("running in stand-alone mode");
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("received shutdown signal");

    if let Some(membership) = membership {
        tracing::info!("broadcasting leave message to cluster");
        membership.leave().await;
    }

    tracing::info!("gracefully shutting down http server");
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => tracing::error!(error = %err, "http server error"),
        Ok(Err(err)) => tracing::error!(error = %err, "http server task panicked"),
        Err(_) => tracing::warn!("drain grace period expired, exiting"),
    }

    tracing::info!("bye bye");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
