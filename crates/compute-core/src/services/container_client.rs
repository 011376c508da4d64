use std::path::Path;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{ComputeError, Result};

use super::protocol::{self, ControlRequest, ControlResponse};

/// The two control operations every container exposes, addressed by port.
///
/// Implementations must allow concurrent calls to different ports.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    async fn load_assembly(&self, port: u16, path: &Path) -> Result<()>;

    async fn health_check(&self, port: u16) -> Result<()>;
}

/// Speaks the framed JSON protocol over a fresh localhost TCP connection per call.
#[derive(Debug, Clone, Default)]
pub struct TcpContainerClient;

impl TcpContainerClient {
    pub fn new() -> Self {
        Self
    }

    async fn call(&self, port: u16, request: &ControlRequest) -> Result<ControlResponse> {
        let control_error = |message: String| ComputeError::Control { port, message };
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| control_error(format!("connect: {e}")))?;
        protocol::send_message(&mut stream, request)
            .await
            .map_err(|e| control_error(format!("send: {e}")))?;
        protocol::receive_message(&mut stream)
            .await
            .map_err(|e| control_error(format!("receive: {e}")))
    }
}

#[async_trait]
impl ContainerClient for TcpContainerClient {
    async fn load_assembly(&self, port: u16, path: &Path) -> Result<()> {
        let request = ControlRequest::LoadAssembly {
            path: path.to_string_lossy().into_owned(),
        };
        match self.call(port, &request).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Unhealthy { reason } => Err(ComputeError::Control {
                port,
                message: reason,
            }),
            ControlResponse::Error { message } => Err(ComputeError::Control { port, message }),
        }
    }

    async fn health_check(&self, port: u16) -> Result<()> {
        match self.call(port, &ControlRequest::HealthCheck).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Unhealthy { reason } => Err(ComputeError::Unhealthy { port, reason }),
            ControlResponse::Error { message } => Err(ComputeError::Control { port, message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_is_a_control_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = TcpContainerClient::new();
        let err = client.health_check(port).await.unwrap_err();
        assert!(matches!(err, ComputeError::Control { port: p, .. } if p == port));
    }
}
