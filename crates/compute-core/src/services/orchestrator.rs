use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, Result};
use crate::models::{AssemblyDistribution, ComputeConfiguration, WorkerIdentity, WorkerState};

use super::container_client::{ContainerClient, TcpContainerClient};
use super::container_controller::ContainerController;
use super::health_monitor::{FaultCallback, FaultHandler, HealthMonitor};
use super::package_manager::PackageManager;
use super::process_manager::ProcessManager;

/// Runs one compute node: start the fleet, deploy the package, watch it, tear down.
pub struct Orchestrator {
    config: ComputeConfiguration,
    processes: Arc<ProcessManager>,
    packages: PackageManager,
    controller: Arc<ContainerController>,
    monitor: HealthMonitor,
    distributions: Vec<AssemblyDistribution>,
}

impl Orchestrator {
    pub fn new(config: ComputeConfiguration) -> Self {
        Self::with_client(config, Arc::new(TcpContainerClient::new()))
    }

    pub fn with_client(config: ComputeConfiguration, client: Arc<dyn ContainerClient>) -> Self {
        let processes = Arc::new(ProcessManager::new(config.port_range, config.shutdown_grace()));
        let controller = Arc::new(ContainerController::new(client, config.call_timeout()));
        let monitor = HealthMonitor::new(
            Arc::clone(&controller),
            log_fault(),
            config.health_check_interval(),
        )
        .with_state_tracking(Arc::clone(&processes));

        Self {
            packages: PackageManager::new(&config),
            config,
            processes,
            controller,
            monitor,
            distributions: Vec::new(),
        }
    }

    /// Replace the default fault handler, which only logs.
    pub fn with_fault_handler(mut self, handler: Arc<dyn FaultHandler>) -> Self {
        self.monitor = HealthMonitor::new(
            Arc::clone(&self.controller),
            handler,
            self.config.health_check_interval(),
        )
        .with_state_tracking(Arc::clone(&self.processes));
        self
    }

    /// Use `packages` instead of the one built from the configuration,
    /// e.g. to attach a package notifier.
    pub fn with_package_manager(mut self, packages: PackageManager) -> Self {
        self.packages = packages;
        self
    }

    pub fn processes(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.processes)
    }

    /// Start the node and keep it running until `shutdown` fires.
    ///
    /// Every path out of this function stops the monitor and the containers and
    /// releases staging, whether startup succeeded, failed or was cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let outcome = match self.start(&shutdown).await {
            Ok(true) => {
                tracing::info!("compute node running, waiting for shutdown");
                shutdown.cancelled().await;
                tracing::info!("shutdown requested");
                Ok(())
            }
            Ok(false) => {
                tracing::info!("shutdown requested during startup");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "startup failed, cleaning up");
                Err(e)
            }
        };

        let cleanup = self.shutdown().await;
        match (outcome, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                tracing::error!(error = %cleanup_err, "cleanup after failed startup was incomplete");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Returns false when `shutdown` fired before the node was fully started.
    async fn start(&mut self, shutdown: &CancellationToken) -> Result<bool> {
        tokio::select! {
            () = shutdown.cancelled() => return Ok(false),
            started = self.processes.start_container_processes(&self.config) => started?,
        }

        let package = match self
            .packages
            .periodically_check_for_valid_package(shutdown)
            .await
        {
            Ok(package) => package,
            Err(ComputeError::Cancelled) => return Ok(false),
            Err(e) => return Err(e),
        };

        let ports = self.processes.get_all_container_ports().await;
        self.distributions = self.packages.distribute(&package, &ports).await?;

        for distribution in &self.distributions {
            self.processes
                .transition(distribution.port, WorkerState::Loading)
                .await;
        }
        let report = tokio::select! {
            () = shutdown.cancelled() => return Ok(false),
            report = self.controller.send_load_signal_to_containers(&self.distributions) => report,
        };
        for &port in &report.loaded {
            self.processes.transition(port, WorkerState::Loaded).await;
        }
        for failure in &report.failures {
            let instance = self.processes.instance(failure.port).await.map(|i| i.instance_id);
            tracing::error!(
                port = failure.port,
                instance,
                assembly = %failure.assembly.display(),
                error = %failure.error,
                "container did not load the assembly"
            );
            self.processes
                .transition(failure.port, WorkerState::Unhealthy)
                .await;
        }

        if report.loaded.is_empty() {
            return Err(ComputeError::LoadFailed(format!(
                "no container loaded the assembly ({})",
                report.failure_summary()
            )));
        }
        if self.config.abort_on_load_failure && !report.is_complete() {
            return Err(ComputeError::LoadFailed(report.failure_summary()));
        }

        if shutdown.is_cancelled() {
            return Ok(false);
        }

        let workers: Vec<WorkerIdentity> = self
            .processes
            .instances()
            .await
            .iter()
            .filter(|instance| report.loaded.contains(&instance.port))
            .map(|instance| instance.identity())
            .collect();
        self.monitor.start(workers);
        Ok(true)
    }

    /// Monitor first, then containers, then staging.
    async fn shutdown(&mut self) -> Result<()> {
        self.monitor.stop().await;

        let stopped = self.processes.stop_all_processes().await;

        let mut released = self.packages.release_staging(&self.distributions).await;
        self.distributions.clear();
        let worker_dirs = self.worker_staging_dirs().await;
        if let Err(e) = self.packages.release_staging_dirs(&worker_dirs).await {
            released = released.and(Err(e));
        }

        tracing::info!("compute node stopped");
        stopped.and(released)
    }

    /// Per-port directories under the staging root, including ones left by
    /// workers that never received a package.
    async fn worker_staging_dirs(&self) -> Vec<PathBuf> {
        let range = self.config.port_range;
        let mut dirs = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.staging_root).await else {
            return dirs;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_worker_dir = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u16>().ok())
                .is_some_and(|port| (range.start..=range.end).contains(&port));
            if is_worker_dir {
                dirs.push(entry.path());
            }
        }
        dirs
    }
}

fn log_fault() -> Arc<dyn FaultHandler> {
    Arc::new(FaultCallback::new(
        |worker: &WorkerIdentity, error: &ComputeError| {
            tracing::error!(%worker, error = %error, "container faulted");
            true
        },
    ))
}
