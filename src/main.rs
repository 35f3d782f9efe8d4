use std::sync::Arc;

use anyhow::Context;
use portgate::config::Config;
use portgate::{ProxyEngine, ProxyError, StaticResolver};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    tracing::info!(
        listen = %cfg.listen_addr,
        ports = ?cfg.ports,
        dial_timeout_ms = cfg.dial_timeout_ms,
        max_connections = cfg.max_connections,
        "Configuration loaded"
    );

    let resolver = Arc::new(StaticResolver::new(cfg.backend_table()?));
    let cancel = CancellationToken::new();

    // Bind every port before accepting on any, so one bad port aborts startup.
    let mut bound = Vec::with_capacity(cfg.ports.len());
    for &port in &cfg.ports {
        let engine = ProxyEngine::new(
            cfg.listen_addr.clone(),
            port,
            cfg.dial_timeout(),
            resolver.clone(),
        )
        .with_max_connections(cfg.max_connections);

        let proxy = engine
            .bind()
            .await
            .with_context(|| format!("failed to start proxy for port {}", port))?;
        bound.push(proxy);
    }

    let mut accept_loops = JoinSet::new();
    for proxy in bound {
        accept_loops.spawn(proxy.run(cancel.clone()));
    }

    let mut failure = None;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }

        Some(res) = accept_loops.join_next() => {
            failure = accept_loop_failure(res);
        }
    }

    cancel.cancel();
    while let Some(res) = accept_loops.join_next().await {
        if let Some(e) = accept_loop_failure(res) {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
    }
}

fn accept_loop_failure(res: Result<Result<(), ProxyError>, JoinError>) -> Option<anyhow::Error> {
    match res {
        Ok(Ok(())) => None,
        Ok(Err(e)) if e.is_shutdown() => None,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Accept loop stopped");
            Some(e.into())
        }
        Err(e) => Some(anyhow::Error::new(e).context("accept loop panicked")),
    }
}
