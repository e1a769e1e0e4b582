//! Background recovery monitors.
//!
//! Three independent periodic loops, each safe to run from any number of
//! orchestrator processes: they enqueue idempotent lifecycle work or mutate
//! individual subtasks through version-conditioned writes, never the run
//! state machine. Shutdown is a watch channel, so an in-flight sweep always
//! finishes before the task exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{MonitorConfig, OrchestratorConfig};
use crate::error::OrchestratorResult;
use crate::events::{Event, EventBus};
use crate::lifecycle::enqueue_tick;
use crate::model::{SubtaskState, TransitionRecord};
use crate::queue::JobQueue;
use crate::store::Store;

/// Finds runs whose deadline passed while `Executing` and nudges their
/// lifecycle; the executing phase does the actual cancellation under the run
/// lease.
pub struct DeadlineMonitor {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    config: MonitorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl DeadlineMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: MonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.deadline_check_interval.as_millis() as u64,
            "deadline monitor started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("deadline monitor shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.deadline_check_interval) => {
                    if let Err(err) = self.sweep().await {
                        metrics::counter!("cairn_monitor_errors_total").increment(1);
                        error!(error = %err, "deadline sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> OrchestratorResult<usize> {
        let overdue = self
            .store
            .executing_runs_past_deadline(Utc::now(), self.config.batch_size)
            .await?;
        for run_id in &overdue {
            if let Some(run) = self.store.get_run(*run_id).await? {
                enqueue_tick(&*self.queue, *run_id, run.state_version, Duration::ZERO).await?;
                debug!(run_id = %run_id, "deadline passed, lifecycle tick enqueued");
            }
        }
        if !overdue.is_empty() {
            info!(count = overdue.len(), "nudged overdue runs");
        }
        Ok(overdue.len())
    }
}

/// Finds assigned/running subtasks whose heartbeat went stale and records the
/// stall as a failed attempt. A crashed worker and a slow worker look the
/// same from here and are treated the same; the failure handler applies the
/// usual retry cap.
pub struct StallMonitor {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    config: MonitorConfig,
    stall_threshold: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl StallMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        config: MonitorConfig,
        orchestrator: &OrchestratorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            stall_threshold: orchestrator.stall_threshold,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.stall_check_interval.as_millis() as u64,
            stall_threshold_secs = self.stall_threshold.as_secs(),
            "stall monitor started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("stall monitor shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.stall_check_interval) => {
                    if let Err(err) = self.sweep().await {
                        metrics::counter!("cairn_monitor_errors_total").increment(1);
                        error!(error = %err, "stall sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> OrchestratorResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stall_threshold).unwrap_or_default();
        let stalled = self
            .store
            .stalled_subtasks(cutoff, self.config.batch_size)
            .await?;

        let mut reset = 0;
        for subtask in &stalled {
            let from = subtask.state;
            if !from.can_transition_to(SubtaskState::Failed) {
                continue;
            }
            let mut updated = subtask.clone();
            let worker = updated
                .assigned_worker
                .as_ref()
                .map(|worker| worker.0.clone())
                .unwrap_or_else(|| "unknown worker".to_string());
            updated.record_error(
                "heartbeat_stalled",
                format!(
                    "no heartbeat from {worker} since {:?}",
                    updated.last_heartbeat_at
                ),
            );
            updated.state = SubtaskState::Failed;
            match self
                .store
                .update_subtask(&updated, subtask.state_version)
                .await
            {
                Ok(version) => {
                    updated.state_version = version;
                    self.store
                        .append_transition(&TransitionRecord::for_subtask(
                            &updated,
                            from,
                            SubtaskState::Failed,
                            "stall",
                        ))
                        .await?;
                    self.bus
                        .publish(Event::subtask_failed(
                            updated.id(),
                            "heartbeat_stalled",
                            "worker heartbeat went stale",
                        ))
                        .await?;
                    metrics::counter!("cairn_subtasks_stalled_total").increment(1);
                    reset += 1;
                }
                // The worker reported in between our scan and the write.
                Err(err) if err.is_concurrency() => {}
                Err(err) => return Err(err),
            }
        }
        if reset > 0 {
            info!(count = reset, "stalled subtasks marked failed");
        }
        Ok(reset)
    }
}

/// Emits a progress event per active run for external observers. Never
/// mutates orchestrator state.
pub struct ProgressMonitor {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    config: MonitorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProgressMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        config: MonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.progress_interval.as_millis() as u64,
            "progress monitor started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("progress monitor shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.progress_interval) => {
                    if let Err(err) = self.sweep().await {
                        metrics::counter!("cairn_monitor_errors_total").increment(1);
                        error!(error = %err, "progress sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> OrchestratorResult<usize> {
        let runs = self.store.active_runs(self.config.batch_size).await?;
        for run in &runs {
            self.bus
                .publish(Event::run_progress(run.id, run.progress))
                .await?;
        }
        Ok(runs.len())
    }
}

/// Handles for a set of spawned monitors.
pub struct MonitorSet {
    handles: Vec<JoinHandle<()>>,
    shutdowns: Vec<watch::Sender<bool>>,
}

impl MonitorSet {
    /// Signal every monitor and wait for in-flight sweeps to finish.
    pub async fn shutdown(self) {
        for tx in &self.shutdowns {
            let _ = tx.send(true);
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Spawn all three monitors with a shared configuration.
pub fn spawn_monitors(
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<dyn EventBus>,
    config: MonitorConfig,
    orchestrator: &OrchestratorConfig,
) -> MonitorSet {
    let mut handles = Vec::new();
    let mut shutdowns = Vec::new();

    let (tx, rx) = watch::channel(false);
    handles.push(tokio::spawn(
        DeadlineMonitor::new(store.clone(), queue, config.clone(), rx).run(),
    ));
    shutdowns.push(tx);

    let (tx, rx) = watch::channel(false);
    handles.push(tokio::spawn(
        StallMonitor::new(store.clone(), bus.clone(), config.clone(), orchestrator, rx).run(),
    ));
    shutdowns.push(tx);

    let (tx, rx) = watch::channel(false);
    handles.push(tokio::spawn(
        ProgressMonitor::new(store, bus, config, rx).run(),
    ));
    shutdowns.push(tx);

    MonitorSet { handles, shutdowns }
}
