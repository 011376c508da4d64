// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use compute_core::models::{ComputeConfiguration, DiscoveryMode, PortRange};

pub const HOST_BIN: &str = env!("CARGO_BIN_EXE_compute-host");

/// `len` consecutive ports that nothing is bound to right now.
pub fn free_range(first_candidate: u16, len: u16) -> PortRange {
    let start = (first_candidate..60000)
        .step_by(101)
        .find(|p| (0..len).all(|i| std::net::TcpListener::bind(("127.0.0.1", p + i)).is_ok()))
        .unwrap();
    PortRange {
        start,
        end: start + len - 1,
    }
}

/// Configuration that launches the real binary in container mode.
pub fn node_config(root: &Path, instance_count: usize, port_range: PortRange) -> ComputeConfiguration {
    ComputeConfiguration {
        package_folder: root.join("package"),
        staging_root: root.join("staging"),
        instance_count,
        port_range,
        polling_interval_ms: 50,
        health_check_interval_ms: 50,
        call_timeout_ms: 2000,
        startup_timeout_ms: 10000,
        shutdown_grace_ms: 3000,
        container_command: Some(vec![HOST_BIN.to_string(), "--host-container".to_string()]),
        wait_for_ready: true,
        discovery: DiscoveryMode::Poll,
        abort_on_load_failure: false,
    }
}

/// Package folder with an assembly, one dependency and a descriptor.
pub fn write_package(folder: &Path, instances: usize) {
    fs::create_dir_all(folder).unwrap();
    fs::write(folder.join("App.dll"), b"assembly").unwrap();
    fs::write(folder.join("App.deps.json"), b"{}").unwrap();
    fs::write(
        folder.join("package.yaml"),
        format!("numberOfInstances: {instances}\nassembly:\n  name: App.dll\n"),
    )
    .unwrap();
}

pub fn staging_is_empty(root: &Path) -> bool {
    fs::read_dir(root.join("staging"))
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Poll `condition` every 20ms until it holds, panicking after `limit`.
pub async fn wait_for<F, Fut>(limit: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while !condition().await {
        assert!(started.elapsed() < limit, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
