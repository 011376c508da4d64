use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, Result};
use crate::models::{DiscoveryMode, PackageDescriptor};

use super::package_reader;

/// Strategy for noticing that a deployable package is available.
#[async_trait]
pub trait PackageDiscovery: Send + Sync {
    /// Wait until a valid descriptor is available and return it.
    ///
    /// Malformed descriptors are logged and retried after the interval.
    /// Returns [`ComputeError::Cancelled`] once `cancel` fires.
    async fn next_package(&mut self, cancel: &CancellationToken) -> Result<PackageDescriptor>;
}

pub fn for_mode(
    mode: DiscoveryMode,
    descriptor_path: PathBuf,
    interval: Duration,
) -> Box<dyn PackageDiscovery> {
    match mode {
        DiscoveryMode::Poll => Box::new(PollingDiscovery::new(descriptor_path, interval)),
        DiscoveryMode::Watch => Box::new(WatchingDiscovery::new(descriptor_path, interval)),
    }
}

/// Returns the first descriptor that parses.
pub struct PollingDiscovery {
    descriptor_path: PathBuf,
    interval: Duration,
}

impl PollingDiscovery {
    pub fn new(descriptor_path: PathBuf, interval: Duration) -> Self {
        Self {
            descriptor_path,
            interval,
        }
    }
}

#[async_trait]
impl PackageDiscovery for PollingDiscovery {
    async fn next_package(&mut self, cancel: &CancellationToken) -> Result<PackageDescriptor> {
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            attempt += 1;
            match package_reader::read_package(&self.descriptor_path).await {
                Ok(package) => return Ok(package),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(attempt, error = %e, "no valid package yet");
                }
                Err(e) => return Err(e),
            }
            pause(cancel, self.interval).await?;
        }
    }
}

/// Modification time and size, enough to tell two versions of a file apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some(Fingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

/// Returns a descriptor each time the file changes into a valid version.
pub struct WatchingDiscovery {
    descriptor_path: PathBuf,
    interval: Duration,
    last_returned: Option<Fingerprint>,
    last_rejected: Option<Fingerprint>,
}

impl WatchingDiscovery {
    pub fn new(descriptor_path: PathBuf, interval: Duration) -> Self {
        Self {
            descriptor_path,
            interval,
            last_returned: None,
            last_rejected: None,
        }
    }
}

#[async_trait]
impl PackageDiscovery for WatchingDiscovery {
    async fn next_package(&mut self, cancel: &CancellationToken) -> Result<PackageDescriptor> {
        loop {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            if let Some(current) = fingerprint(&self.descriptor_path).await {
                let changed = Some(current) != self.last_returned;
                let already_rejected = Some(current) == self.last_rejected;
                if changed && !already_rejected {
                    match package_reader::read_package(&self.descriptor_path).await {
                        Ok(package) => {
                            self.last_returned = Some(current);
                            self.last_rejected = None;
                            return Ok(package);
                        }
                        Err(e) if e.is_recoverable() => {
                            tracing::warn!(error = %e, "descriptor changed but is not valid");
                            self.last_rejected = Some(current);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            pause(cancel, self.interval).await?;
        }
    }
}

async fn pause(cancel: &CancellationToken, interval: Duration) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(ComputeError::Cancelled),
        () = tokio::time::sleep(interval) => Ok(()),
    }
}
