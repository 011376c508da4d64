use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{ComputeError, Result};
use crate::models::{ComputeConfiguration, PortRange, WorkerInstance, WorkerState};

use super::ports::PortAllocator;

/// Argument that switches the host binary into container mode.
pub const HOST_CONTAINER_FLAG: &str = "--host-container";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running container process together with its output forwarder.
struct ManagedProcess {
    instance: WorkerInstance,
    child: Child,
    _output_task: JoinHandle<()>,
}

/// Owns every container process and the ports they listen on.
///
/// This is the only component that creates, removes or terminates workers.
/// Everything else refers to workers by port and reports state changes
/// through [`ProcessManager::transition`].
pub struct ProcessManager {
    ports: PortAllocator,
    /// Kept in start order; callers rely on this ordering.
    processes: RwLock<Vec<ManagedProcess>>,
    shutdown_grace: Duration,
}

impl ProcessManager {
    pub fn new(port_range: PortRange, shutdown_grace: Duration) -> Self {
        Self {
            ports: PortAllocator::new(port_range),
            processes: RwLock::new(Vec::new()),
            shutdown_grace,
        }
    }

    /// Launch `config.instance_count` container processes, each on a fresh port.
    ///
    /// If any launch fails, the ones already started are stopped before the
    /// error is returned.
    pub async fn start_container_processes(&self, config: &ComputeConfiguration) -> Result<()> {
        let (program, base_args) = container_command(config)?;

        for _ in 0..config.instance_count {
            if let Err(e) = self.start_one(config, &program, &base_args).await {
                tracing::error!(error = %e, "container launch failed, rolling back");
                if let Err(stop_err) = self.stop_all_processes().await {
                    tracing::error!(error = %stop_err, "rollback did not stop cleanly");
                }
                return Err(e);
            }
        }

        tracing::info!(count = config.instance_count, "all container processes started");
        Ok(())
    }

    async fn start_one(
        &self,
        config: &ComputeConfiguration,
        program: &Path,
        base_args: &[String],
    ) -> Result<()> {
        let instance_id = self.processes.read().await.len();
        // Released on error, and also if this future is dropped mid-spawn.
        let lease = self.ports.lease()?;
        let port = lease.port();
        let staging_dir = config.staging_dir_for(port);

        let process = self
            .spawn_container(instance_id, port, &staging_dir, program, base_args, config)
            .await?;
        tracing::info!(
            instance = instance_id,
            port,
            pid = process.instance.pid,
            "container process running"
        );
        self.processes.write().await.push(process);
        lease.keep();
        Ok(())
    }

    async fn spawn_container(
        &self,
        instance_id: usize,
        port: u16,
        staging_dir: &Path,
        program: &Path,
        base_args: &[String],
        config: &ComputeConfiguration,
    ) -> Result<ManagedProcess> {
        let process_error = |message: String| ComputeError::Process {
            instance: instance_id,
            message,
        };

        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| process_error(format!("create staging dir {}: {e}", staging_dir.display())))?;

        let mut instance = WorkerInstance::new(instance_id, port, staging_dir.to_path_buf());

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .arg("--port")
            .arg(port.to_string())
            .arg("--staging")
            .arg(staging_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| process_error(format!("failed to spawn {}: {e}", program.display())))?;
        instance.pid = child.id();

        let output_task = forward_output(&mut child, instance_id);

        if config.wait_for_ready {
            if let Err(e) = wait_until_listening(&mut child, port, config.startup_timeout()).await {
                child.kill().await.ok();
                output_task.abort();
                return Err(process_error(e));
            }
        }

        instance.state = WorkerState::Unloaded;
        Ok(ManagedProcess {
            instance,
            child,
            _output_task: output_task,
        })
    }

    /// Ports of running containers, in the order they were started.
    pub async fn get_all_container_ports(&self) -> Vec<u16> {
        self.processes
            .read()
            .await
            .iter()
            .filter(|p| p.instance.state.is_running())
            .map(|p| p.instance.port)
            .collect()
    }

    /// Snapshot of every tracked worker.
    pub async fn instances(&self) -> Vec<WorkerInstance> {
        self.processes
            .read()
            .await
            .iter()
            .map(|p| p.instance.clone())
            .collect()
    }

    pub async fn instance(&self, port: u16) -> Option<WorkerInstance> {
        self.processes
            .read()
            .await
            .iter()
            .find(|p| p.instance.port == port)
            .map(|p| p.instance.clone())
    }

    /// Record a lifecycle transition for the worker on `port`.
    ///
    /// Returns false if the worker is unknown or already stopped.
    pub async fn transition(&self, port: u16, state: WorkerState) -> bool {
        let mut processes = self.processes.write().await;
        match processes.iter_mut().find(|p| p.instance.port == port) {
            Some(p) if p.instance.state != WorkerState::Stopped => {
                if p.instance.state != state {
                    tracing::debug!(port, from = ?p.instance.state, to = ?state, "worker state change");
                }
                p.instance.state = state;
                true
            }
            _ => false,
        }
    }

    /// Terminate every tracked container. Safe to call repeatedly.
    pub async fn stop_all_processes(&self) -> Result<()> {
        let drained: Vec<ManagedProcess> = {
            let mut processes = self.processes.write().await;
            processes.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let grace = self.shutdown_grace;
        tracing::info!(count = drained.len(), "stopping container processes");

        let results = join_all(drained.into_iter().map(|mut process| async move {
            let result = terminate(&mut process, grace).await;
            process._output_task.abort();
            (process.instance.port, result)
        }))
        .await;

        let mut failures = Vec::new();
        for (port, result) in results {
            self.ports.release(port);
            if let Err(e) = result {
                tracing::error!(port, error = %e, "container did not terminate");
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ComputeError::Shutdown(failures.join("; ")))
        }
    }
}

/// Resolve the program and leading arguments used to launch a container.
fn container_command(config: &ComputeConfiguration) -> Result<(PathBuf, Vec<String>)> {
    match &config.container_command {
        Some(command) => {
            let (program, args) = command.split_first().ok_or_else(|| {
                ComputeError::InvalidConfig("container_command must name a program".into())
            })?;
            Ok((PathBuf::from(program), args.to_vec()))
        }
        None => {
            let exe = std::env::current_exe()?;
            Ok((exe, vec![HOST_CONTAINER_FLAG.to_string()]))
        }
    }
}

/// Forward a container's stdout/stderr into the log, tagged with its instance id.
fn forward_output(child: &mut Child, instance_id: usize) -> JoinHandle<()> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let out = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(instance = instance_id, "{line}");
                }
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(instance = instance_id, stream = "stderr", "{line}");
                }
            }
        };
        tokio::join!(out, err);
    })
}

async fn wait_until_listening(
    child: &mut Child,
    port: u16,
    limit: Duration,
) -> std::result::Result<(), String> {
    let deadline = Instant::now() + limit;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("exited during startup ({status})"));
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!("not listening on port {port} after {limit:?}"));
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

/// Ask the container to exit, then force it once the grace period runs out.
async fn terminate(process: &mut ManagedProcess, grace: Duration) -> Result<()> {
    let instance = process.instance.instance_id;
    let uptime_s = (Utc::now() - process.instance.started_at).num_seconds();
    let child = &mut process.child;

    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(instance, %status, "container already exited");
        return Ok(());
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(instance, uptime_s, %status, "container exited");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!(instance, error = %e, "waiting for container failed, forcing");
                }
                Err(_) => {
                    tracing::warn!(instance, ?grace, "container ignored SIGTERM, forcing termination");
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    tracing::debug!(instance, uptime_s, "killing container");
    child.kill().await.map_err(|e| ComputeError::Process {
        instance,
        message: format!("failed to kill: {e}"),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::DiscoveryMode;

    fn free_range(len: u16) -> PortRange {
        for base in (43000..60000).step_by(89) {
            let range = PortRange {
                start: base,
                end: base + len - 1,
            };
            if range
                .iter()
                .all(|p| std::net::TcpListener::bind(("127.0.0.1", p)).is_ok())
            {
                return range;
            }
        }
        panic!("no free port range found");
    }

    fn sleeper_config(staging_root: &Path, count: usize, range: PortRange) -> ComputeConfiguration {
        ComputeConfiguration {
            package_folder: staging_root.join("package"),
            staging_root: staging_root.to_path_buf(),
            instance_count: count,
            port_range: range,
            polling_interval_ms: 50,
            health_check_interval_ms: 50,
            call_timeout_ms: 500,
            startup_timeout_ms: 500,
            shutdown_grace_ms: 500,
            // Appended --port/--staging become positional parameters of the script.
            container_command: Some(vec![
                "sh".into(),
                "-c".into(),
                "exec sleep 30".into(),
                "container".into(),
            ]),
            wait_for_ready: false,
            discovery: DiscoveryMode::Poll,
            abort_on_load_failure: false,
        }
    }

    #[tokio::test]
    async fn starts_distinct_ports_in_order_with_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(3);
        let config = sleeper_config(dir.path(), 3, range);
        let manager = ProcessManager::new(range, config.shutdown_grace());

        manager.start_container_processes(&config).await.unwrap();
        let ports = manager.get_all_container_ports().await;
        assert_eq!(ports.len(), 3);
        let distinct: std::collections::HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(ports, vec![range.start, range.start + 1, range.start + 2]);
        for port in &ports {
            assert!(config.staging_dir_for(*port).is_dir());
        }

        let instances = manager.instances().await;
        assert!(instances.iter().all(|i| i.state == WorkerState::Unloaded));
        assert!(instances.iter().all(|i| i.pid.is_some()));

        manager.stop_all_processes().await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(2);
        let config = sleeper_config(dir.path(), 2, range);
        let manager = ProcessManager::new(range, config.shutdown_grace());
        manager.start_container_processes(&config).await.unwrap();

        manager.stop_all_processes().await.unwrap();
        assert!(manager.get_all_container_ports().await.is_empty());
        manager.stop_all_processes().await.unwrap();
        assert!(manager.get_all_container_ports().await.is_empty());
        assert!(manager.instances().await.is_empty());
    }

    #[tokio::test]
    async fn stop_with_nothing_running_is_a_no_op() {
        let manager = ProcessManager::new(free_range(1), Duration::from_millis(100));
        manager.stop_all_processes().await.unwrap();
    }

    #[tokio::test]
    async fn stubborn_container_is_force_killed() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(1);
        let mut config = sleeper_config(dir.path(), 1, range);
        config.shutdown_grace_ms = 100;
        config.container_command = Some(vec![
            "sh".into(),
            "-c".into(),
            "trap '' TERM; while :; do sleep 1; done".into(),
            "container".into(),
        ]);
        let manager = ProcessManager::new(range, config.shutdown_grace());
        manager.start_container_processes(&config).await.unwrap();
        // Give the shell a moment to install its trap.
        sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        manager.stop_all_processes().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(manager.instances().await.is_empty());
    }

    #[tokio::test]
    async fn failed_launch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(2);
        let mut config = sleeper_config(dir.path(), 2, range);
        config.container_command = Some(vec!["/nonexistent/container-binary".into()]);
        let manager = ProcessManager::new(range, config.shutdown_grace());

        let err = manager.start_container_processes(&config).await.unwrap_err();
        assert!(matches!(err, ComputeError::Process { instance: 0, .. }));
        assert!(manager.instances().await.is_empty());
        assert_eq!(manager.ports.allocated_count(), 0);
    }

    #[tokio::test]
    async fn container_that_never_listens_fails_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(2);
        let mut config = sleeper_config(dir.path(), 2, range);
        config.wait_for_ready = true;
        config.startup_timeout_ms = 200;
        let manager = ProcessManager::new(range, config.shutdown_grace());

        let err = manager.start_container_processes(&config).await.unwrap_err();
        assert!(matches!(err, ComputeError::Process { .. }));
        assert!(manager.get_all_container_ports().await.is_empty());
    }

    #[tokio::test]
    async fn transition_refuses_unknown_ports() {
        let dir = tempfile::tempdir().unwrap();
        let range = free_range(1);
        let config = sleeper_config(dir.path(), 1, range);
        let manager = ProcessManager::new(range, config.shutdown_grace());
        manager.start_container_processes(&config).await.unwrap();

        assert!(manager.transition(range.start, WorkerState::Loaded).await);
        assert_eq!(
            manager.instance(range.start).await.unwrap().state,
            WorkerState::Loaded
        );
        assert!(!manager.transition(1, WorkerState::Loaded).await);

        manager.stop_all_processes().await.unwrap();
    }
}
