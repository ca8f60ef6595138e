//! `drover serve`: run the worker-facing orchestrator API with the
//! periodic reclaim sweep.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;

use drover_core::claim;
use drover_core::server::{AppState, build_router};

pub async fn run_serve(
    pool: PgPool,
    agent_key: String,
    bind: &str,
    port: u16,
    sweep_interval: Duration,
) -> Result<()> {
    let state = AppState {
        pool: pool.clone(),
        agent_key,
    };
    let app = build_router(state);

    // Reclaim sweep: once at startup (restart recovery), then on a fixed
    // period. The sweep itself is idempotent.
    let sweep_pool = pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            match claim::run_reclaim_sweep(&sweep_pool).await {
                Ok(report) => {
                    if !report.reclaimed.is_empty() || !report.quarantined.is_empty() {
                        tracing::info!(
                            reclaimed = report.reclaimed.len(),
                            quarantined = report.quarantined.len(),
                            "reclaim sweep pass finished"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "reclaim sweep failed"),
            }
        }
    });

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("drover serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
