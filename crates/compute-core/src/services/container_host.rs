//! Container side of the control protocol.
//!
//! Each container process listens on localhost, accepts one request per
//! connection and remembers which assembly it was told to load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::protocol::{self, ControlRequest, ControlResponse};

struct HostState {
    loaded: Mutex<Option<PathBuf>>,
}

impl HostState {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::LoadAssembly { path } => self.load(Path::new(&path)).await,
            ControlRequest::HealthCheck => self.health().await,
        }
    }

    async fn load(&self, path: &Path) -> ControlResponse {
        if !is_file(path).await {
            return ControlResponse::Error {
                message: format!("assembly {} not found", path.display()),
            };
        }
        tracing::info!(assembly = %path.display(), "assembly loaded");
        *self.loaded.lock().await = Some(path.to_path_buf());
        ControlResponse::Ok
    }

    async fn health(&self) -> ControlResponse {
        let loaded = self.loaded.lock().await.clone();
        match loaded {
            None => ControlResponse::Unhealthy {
                reason: "no assembly loaded".into(),
            },
            Some(path) if !is_file(&path).await => ControlResponse::Unhealthy {
                reason: format!("assembly {} disappeared", path.display()),
            },
            Some(_) => ControlResponse::Ok,
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Serve the control protocol on `127.0.0.1:port` until `cancel` fires.
pub async fn serve(port: u16, staging_dir: PathBuf, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    serve_listener(listener, staging_dir, cancel).await
}

pub async fn serve_listener(
    listener: TcpListener,
    staging_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(HostState {
        loaded: Mutex::new(None),
    });
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        staging = %staging_dir.display(),
        "container host listening"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &state).await {
                            tracing::debug!(error = %e, "control connection ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    tracing::info!("container host stopped");
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, state: &HostState) -> Result<()> {
    let request: ControlRequest = protocol::receive_message(&mut stream).await?;
    tracing::debug!(?request, "control request");
    let response = state.handle(request).await;
    protocol::send_message(&mut stream, &response).await
}
