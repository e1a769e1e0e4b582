//! Lifecycle queue dispatcher.
//!
//! Drains lifecycle ticks from the queue and runs `process(run_id)` for each
//! under a bounded concurrency cap. Duplicate delivery is expected and
//! harmless: `process` is idempotent and lease-guarded.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, LIFECYCLE_QUEUE};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lifecycle::RunLifecycleManager;
use crate::model::RunId;
use crate::queue::JobQueue;

pub struct LifecycleDispatcher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LifecycleDispatcher {
    pub fn start(
        config: DispatcherConfig,
        manager: Arc<RunLifecycleManager>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = DispatcherTask {
            config,
            manager,
            queue,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> OrchestratorResult<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| OrchestratorError::Queue(format!("dispatcher task panicked: {err}")))
    }
}

struct DispatcherTask {
    config: DispatcherConfig,
    manager: Arc<RunLifecycleManager>,
    queue: Arc<dyn JobQueue>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DispatcherTask {
    async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "lifecycle dispatcher started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(&semaphore).await {
                        metrics::counter!("cairn_dispatch_errors_total").increment(1);
                        error!(error = %err, "lifecycle poll failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("lifecycle dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        self.wait_for_inflight(&semaphore).await;
    }

    async fn poll_once(&self, semaphore: &Arc<Semaphore>) -> OrchestratorResult<()> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }
        let limit = available.min(self.config.batch_size.max(1) as usize);
        let jobs = self.queue.pull(LIFECYCLE_QUEUE, limit).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!(count = jobs.len(), "processing lifecycle ticks");
        for job in jobs {
            let Some(run_id) = parse_run_id(&job.payload) else {
                warn!(job_id = %job.job_id, "malformed lifecycle tick dropped");
                continue;
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| OrchestratorError::Queue(err.to_string()))?;
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                Self::process_tick(manager, run_id, permit).await;
            });
        }
        Ok(())
    }

    async fn process_tick(
        manager: Arc<RunLifecycleManager>,
        run_id: RunId,
        _permit: OwnedSemaphorePermit,
    ) {
        if let Err(err) = manager.process(run_id).await {
            metrics::counter!("cairn_dispatch_errors_total").increment(1);
            error!(run_id = %run_id, error = %err, "lifecycle tick failed");
        }
    }

    async fn wait_for_inflight(&self, semaphore: &Arc<Semaphore>) {
        let expected = self.config.max_concurrent.max(1);
        loop {
            if semaphore.available_permits() == expected {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

fn parse_run_id(payload: &Value) -> Option<RunId> {
    serde_json::from_value(payload.get("run_id")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn parse_run_id_accepts_tick_payloads() {
        let id = Uuid::new_v4();
        let parsed = parse_run_id(&json!({ "run_id": id }));
        assert_eq!(parsed, Some(RunId(id)));

        assert!(parse_run_id(&json!({})).is_none());
        assert!(parse_run_id(&json!({ "run_id": "not-a-uuid" })).is_none());
    }
}
