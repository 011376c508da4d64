use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ComputeError;
use crate::models::{FaultEvent, WorkerIdentity, WorkerState};

use super::container_controller::{ContainerController, ProbeReport};
use super::events::ContainerFaulted;
use super::process_manager::ProcessManager;

/// Decides what happens when a container fails a health probe.
#[async_trait]
pub trait FaultHandler: Send + Sync {
    /// Return `true` to keep probing `worker`, `false` to give up on it.
    async fn on_fault(&self, worker: &WorkerIdentity, error: &ComputeError) -> bool;
}

/// Adapts a plain closure into a [`FaultHandler`].
pub struct FaultCallback<F> {
    callback: F,
}

impl<F> FaultCallback<F>
where
    F: Fn(&WorkerIdentity, &ComputeError) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> FaultHandler for FaultCallback<F>
where
    F: Fn(&WorkerIdentity, &ComputeError) -> bool + Send + Sync,
{
    async fn on_fault(&self, worker: &WorkerIdentity, error: &ComputeError) -> bool {
        (self.callback)(worker, error)
    }
}

/// Event-driven handling: every fault becomes a [`FaultEvent`] handled on the
/// notifier's dispatcher, and probing always continues. Faults raised while
/// the queue is full are dropped with a warning.
#[async_trait]
impl FaultHandler for ContainerFaulted {
    async fn on_fault(&self, worker: &WorkerIdentity, error: &ComputeError) -> bool {
        let event = FaultEvent {
            worker: worker.clone(),
            reason: error.to_string(),
            occurred_at: Utc::now(),
        };
        // Never wait for queue room here: that would stall this worker's probes.
        if let Err(e) = self.try_publish(event) {
            tracing::warn!(%worker, error = %e, "fault notification not delivered");
        }
        true
    }
}

/// Run `handler`, treating a panic inside it as "keep probing".
pub(crate) async fn dispatch_fault(
    handler: &dyn FaultHandler,
    worker: &WorkerIdentity,
    error: &ComputeError,
) -> bool {
    match AssertUnwindSafe(handler.on_fault(worker, error))
        .catch_unwind()
        .await
    {
        Ok(keep_probing) => keep_probing,
        Err(_) => {
            tracing::error!(%worker, "fault handler panicked");
            true
        }
    }
}

/// Owns one probe loop per loaded container.
pub struct HealthMonitor {
    controller: Arc<ContainerController>,
    handler: Arc<dyn FaultHandler>,
    interval: Duration,
    processes: Option<Arc<ProcessManager>>,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(
        controller: Arc<ContainerController>,
        handler: Arc<dyn FaultHandler>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            handler,
            interval,
            processes: None,
            cancel: CancellationToken::new(),
            loops: Vec::new(),
            recorder: None,
        }
    }

    /// Record each probe outcome as a `Healthy`/`Unhealthy` transition.
    pub fn with_state_tracking(mut self, processes: Arc<ProcessManager>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Begin probing `workers`. Returns immediately; loops run in the background.
    pub fn start(&mut self, workers: Vec<WorkerIdentity>) {
        if !self.loops.is_empty() {
            tracing::warn!("health monitor already running");
            return;
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let reports = self.processes.clone().map(|processes| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.recorder = Some(tokio::spawn(record_states(processes, rx)));
            tx
        });

        tracing::info!(count = workers.len(), "starting periodic health checks");
        for worker in workers {
            let handle = self.controller.start_periodic_health_check(
                worker,
                self.interval,
                Arc::clone(&self.handler),
                reports.clone(),
                self.cancel.child_token(),
            );
            self.loops.push(handle);
        }
    }

    /// Number of probe loops still running.
    pub fn running_loops(&self) -> usize {
        self.loops.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop every loop and wait until none is left running.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "health check loop panicked");
                }
            }
        }
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.await {
                tracing::error!(error = %e, "state recorder failed");
            }
        }
        tracing::info!("health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn record_states(
    processes: Arc<ProcessManager>,
    mut rx: mpsc::UnboundedReceiver<ProbeReport>,
) {
    while let Some(report) = rx.recv().await {
        let state = if report.result.healthy {
            WorkerState::Healthy
        } else {
            WorkerState::Unhealthy
        };
        processes.transition(report.worker.port, state).await;
    }
}
