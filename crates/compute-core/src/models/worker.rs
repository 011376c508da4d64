use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    /// Process is up but has not been told to load an assembly.
    Unloaded,
    Loading,
    Loaded,
    Healthy,
    Unhealthy,
    Stopped,
}

impl WorkerState {
    pub fn is_running(self) -> bool {
        !matches!(self, WorkerState::Starting | WorkerState::Stopped)
    }
}

/// Immutable snapshot of a worker's identity, safe to hand to background loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub instance_id: usize,
    pub port: u16,
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container #{} (port {})", self.instance_id, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub instance_id: usize,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub staging_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl WorkerInstance {
    pub fn new(instance_id: usize, port: u16, staging_dir: PathBuf) -> Self {
        Self {
            instance_id,
            port,
            pid: None,
            state: WorkerState::Starting,
            staging_dir,
            started_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            instance_id: self.instance_id,
            port: self.port,
        }
    }
}
