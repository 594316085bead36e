use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jtd_api::app::{self, services};
use jtd_infra::{PipelineConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jtd_observability::init();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let bind_addr = std::env::var("JTD_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let run_worker = std::env::var("JTD_RUN_WORKER")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    let services = Arc::new(services::build_services(PipelineConfig::from_env()).await?);
    let worker = run_worker.then(|| services.spawn_worker(WorkerConfig::default()));

    let app = app::build_app(jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        let stats = worker.shutdown().await;
        info!(?stats, "worker stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
