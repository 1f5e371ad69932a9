use anyhow::{Context, Result};
use ensemble_core::{init_tracing, EnsembleConfig, EnsembleContext};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    let config = EnsembleConfig::load().context("loading ensemble config")?;
    let ctx = EnsembleContext::start(config).context("starting ensemble context")?;

    let failures = ctx.preload().await;
    for err in &failures {
        warn!(target: "inference-gateway", error = %err, "model unavailable at startup");
    }
    let status = serde_json::to_string(&ctx.status())?;
    info!(
        target: "inference-gateway",
        models = ctx.registry().len(),
        ready = ctx.manager().ready_count(),
        failed = failures.len(),
        %status,
        "inference-gateway ready"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!(target: "inference-gateway", "shutdown requested");
    let pinned = ctx.shutdown().await;
    info!(target: "inference-gateway", pinned, "inference-gateway stopped");
    Ok(())
}
