use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, Result};
use crate::models::{AssemblyDistribution, HealthCheckResult, WorkerIdentity};

use super::container_client::ContainerClient;
use super::health_monitor::{dispatch_fault, FaultHandler};

/// Outcome of one probe, as reported by a health-check loop.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub worker: WorkerIdentity,
    pub result: HealthCheckResult,
}

#[derive(Debug)]
pub struct LoadFailure {
    pub port: u16,
    pub assembly: PathBuf,
    pub error: ComputeError,
}

/// Every load-signal outcome, successes and failures alike.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<u16>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("port {}: {}", f.port, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Drives the control protocol against a fleet of containers.
pub struct ContainerController {
    client: Arc<dyn ContainerClient>,
    call_timeout: Duration,
}

impl ContainerController {
    pub fn new(client: Arc<dyn ContainerClient>, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    /// Tell every container to load its staged assembly, concurrently, and
    /// wait for all of them. One failure never cancels the others.
    pub async fn send_load_signal_to_containers(
        &self,
        distributions: &[AssemblyDistribution],
    ) -> LoadReport {
        tracing::info!(count = distributions.len(), "sending load signal");

        let outcomes = join_all(distributions.iter().map(|d| async move {
            let result = match timeout(
                self.call_timeout,
                self.client.load_assembly(d.port, &d.destination_path),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ComputeError::Timeout {
                    port: d.port,
                    operation: "load assembly",
                }),
            };
            (d, result)
        }))
        .await;

        let mut report = LoadReport::default();
        for (distribution, result) in outcomes {
            match result {
                Ok(()) => {
                    tracing::info!(port = distribution.port, "assembly loaded");
                    report.loaded.push(distribution.port);
                }
                Err(error) => {
                    tracing::warn!(port = distribution.port, error = %error, "load signal failed");
                    report.failures.push(LoadFailure {
                        port: distribution.port,
                        assembly: distribution.destination_path.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    /// One bounded health probe.
    pub async fn check_health(&self, worker: &WorkerIdentity) -> Result<()> {
        match timeout(self.call_timeout, self.client.health_check(worker.port)).await {
            Ok(result) => result,
            Err(_) => Err(ComputeError::Timeout {
                port: worker.port,
                operation: "health check",
            }),
        }
    }

    /// Probe `worker` every `every` until `cancel` fires or `on_failure` returns false.
    ///
    /// Probes of one worker never overlap. `on_failure` runs once per failed
    /// probe; each probe outcome is also sent to `reports` when given.
    pub fn start_periodic_health_check(
        self: &Arc<Self>,
        worker: WorkerIdentity,
        every: Duration,
        on_failure: Arc<dyn FaultHandler>,
        reports: Option<mpsc::UnboundedSender<ProbeReport>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(%worker, "health checks started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = tokio::select! {
                    () = cancel.cancelled() => break,
                    outcome = controller.check_health(&worker) => outcome,
                };

                let result = match &outcome {
                    Ok(()) => HealthCheckResult::healthy(),
                    Err(e) => HealthCheckResult::failed(e.to_string()),
                };
                if let Some(reports) = &reports {
                    let _ = reports.send(ProbeReport {
                        worker: worker.clone(),
                        result,
                    });
                }

                if let Err(error) = outcome {
                    tracing::warn!(%worker, error = %error, "health check failed");
                    if !dispatch_fault(on_failure.as_ref(), &worker, &error).await {
                        tracing::info!(%worker, "fault handler gave up on container");
                        break;
                    }
                }
            }

            tracing::debug!(%worker, "health checks stopped");
        })
    }
}
