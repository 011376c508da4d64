mod common;

use std::fs;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use common::{free_range, staging_is_empty, write_package, HOST_BIN};

#[test]
fn missing_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(HOST_BIN)
        .arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config file not found"), "stderr: {stderr}");
}

#[test]
fn container_mode_requires_a_port() {
    let output = Command::new(HOST_BIN)
        .arg("--host-container")
        .arg("--staging")
        .arg(".")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("requires --port"));
}

#[cfg(unix)]
#[test]
fn sigterm_stops_the_node_and_releases_staging() {
    let dir = tempfile::tempdir().unwrap();
    let range = free_range(50000, 2);
    let package = dir.path().join("package");
    let staging = dir.path().join("staging");
    write_package(&package, 2);
    let config_path = dir.path().join("compute.yaml");
    fs::write(
        &config_path,
        format!(
            "package_folder: {}\nstaging_root: {}\ninstance_count: 2\nport_range:\n  start: {}\n  end: {}\npolling_interval_ms: 50\nhealth_check_interval_ms: 50\n",
            package.display(),
            staging.display(),
            range.start,
            range.end
        ),
    )
    .unwrap();

    let mut child = Command::new(HOST_BIN)
        .arg("--config")
        .arg(&config_path)
        .arg("--log-file")
        .arg(dir.path().join("node.log"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let staged = [
        staging.join(range.start.to_string()).join("App.dll"),
        staging.join(range.end.to_string()).join("App.dll"),
    ];
    let started = Instant::now();
    while !staged.iter().all(|p| p.is_file()) {
        if started.elapsed() > Duration::from_secs(20) {
            child.kill().ok();
            panic!("package was never staged");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    // Give the load signal time to land before stopping.
    std::thread::sleep(Duration::from_millis(300));

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let started = Instant::now();
    let exit = loop {
        if let Some(exit) = child.try_wait().unwrap() {
            break exit;
        }
        if started.elapsed() > Duration::from_secs(15) {
            child.kill().ok();
            panic!("node did not stop after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert!(exit.success());
    assert!(staging_is_empty(dir.path()));
    let log = fs::read_to_string(dir.path().join("node.log")).unwrap();
    assert!(log.contains("compute node stopped"));
}
