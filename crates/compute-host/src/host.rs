//! Container mode: one worker serving the control protocol for the orchestrator.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use compute_core::services::container_host;

/// Entry point when `--host-container` is passed.
pub async fn run_host(
    port: u16,
    staging: PathBuf,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    tracing::info!(port, pid = std::process::id(), "container host starting");
    container_host::serve(port, staging, shutdown).await?;
    Ok(())
}
