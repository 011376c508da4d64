use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Inclusive range of TCP ports handed out to container processes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// How the package manager notices a deployable package.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Poll until the first valid descriptor appears.
    #[default]
    Poll,
    /// Report every new version of the descriptor.
    Watch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeConfiguration {
    pub package_folder: PathBuf,
    pub staging_root: PathBuf,
    pub instance_count: usize,
    pub port_range: PortRange,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub container_command: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default)]
    pub discovery: DiscoveryMode,
    #[serde(default)]
    pub abort_on_load_failure: bool,
}

impl ComputeConfiguration {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Staging directory owned by the container listening on `port`.
    pub fn staging_dir_for(&self, port: u16) -> PathBuf {
        self.staging_root.join(port.to_string())
    }
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_health_check_interval_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}
