use chrono::{DateTime, Utc};

use super::worker::WorkerIdentity;

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
        }
    }
}

/// Published once per failed probe.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub worker: WorkerIdentity,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}
