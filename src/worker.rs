//! Worker-side contract against the store.
//!
//! Workers never call methods on the orchestrator. They claim a queued
//! subtask, heartbeat while executing, optionally persist a checkpoint, and
//! report the outcome; the orchestrator reacts through the event bus. Every
//! operation is a conditional write at the subtask's own version, so worker
//! reporting never contends on the run lease.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus};
use crate::model::{
    Checkpoint, ExecutionToken, Subtask, SubtaskId, SubtaskState, TransitionRecord, WorkerId,
};
use crate::store::Store;

pub struct WorkerClient {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    worker_id: WorkerId,
}

impl WorkerClient {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, worker_id: WorkerId) -> Self {
        Self {
            store,
            bus,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Claim a `Queued` subtask: transition it to `Assigned` with a fresh
    /// execution token. Returns `None` when the subtask is gone, no longer
    /// queued (duplicate queue delivery), or another worker won the race.
    pub async fn claim(&self, id: SubtaskId) -> OrchestratorResult<Option<Subtask>> {
        let Some(subtask) = self.store.get_subtask(id).await? else {
            return Ok(None);
        };
        if subtask.state != SubtaskState::Queued {
            debug!(subtask = %id, state = %subtask.state, "claim skipped, not queued");
            return Ok(None);
        }

        let mut updated = subtask.clone();
        updated.state = SubtaskState::Assigned;
        updated.assigned_worker = Some(self.worker_id.clone());
        updated.execution_token = Some(ExecutionToken::new());
        updated.last_heartbeat_at = Some(Utc::now());

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
                        SubtaskState::Queued,
                        SubtaskState::Assigned,
                        "worker_claim",
                    ))
                    .await?;
                Ok(Some(updated))
            }
            Err(err) if err.is_concurrency() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Begin execution: `Assigned -> Running`. Requires a live assignment
    /// held by this worker.
    pub async fn start(&self, subtask: &mut Subtask) -> OrchestratorResult<()> {
        self.verify_assignment(subtask)?;
        self.transition(subtask, SubtaskState::Running, "worker_start")
            .await
    }

    pub async fn heartbeat(&self, subtask: &mut Subtask) -> OrchestratorResult<()> {
        self.verify_assignment(subtask)?;
        subtask.last_heartbeat_at = Some(Utc::now());
        subtask.state_version = self
            .store
            .update_subtask(subtask, subtask.state_version)
            .await?;
        Ok(())
    }

    /// Persist resumable progress. A different worker must be able to resume
    /// from this state; the worker id is only an affinity hint.
    pub async fn checkpoint(
        &self,
        subtask: &mut Subtask,
        step: u32,
        state: Value,
    ) -> OrchestratorResult<()> {
        self.verify_assignment(subtask)?;
        subtask.checkpoint = Some(Checkpoint {
            step,
            state,
            worker: Some(self.worker_id.clone()),
        });
        subtask.last_heartbeat_at = Some(Utc::now());
        subtask.state_version = self
            .store
            .update_subtask(subtask, subtask.state_version)
            .await?;
        Ok(())
    }

    pub async fn complete(&self, subtask: &mut Subtask, result: Value) -> OrchestratorResult<()> {
        self.verify_assignment(subtask)?;
        subtask.result = Some(result);
        self.transition(subtask, SubtaskState::Completed, "worker_complete")
            .await?;
        self.bus.publish(Event::subtask_completed(subtask.id())).await?;
        metrics::counter!("cairn_subtasks_completed_total").increment(1);
        Ok(())
    }

    pub async fn fail(
        &self,
        subtask: &mut Subtask,
        code: &str,
        message: &str,
    ) -> OrchestratorResult<()> {
        self.verify_assignment(subtask)?;
        // The error lands in the history before the transition so the audit
        // trail survives even if the transition is later found invalid.
        subtask.record_error(code, message);
        self.transition(subtask, SubtaskState::Failed, "worker_fail")
            .await?;
        self.bus
            .publish(Event::subtask_failed(subtask.id(), code, message))
            .await?;
        metrics::counter!("cairn_subtask_failures_total").increment(1);
        Ok(())
    }

    fn verify_assignment(&self, subtask: &Subtask) -> OrchestratorResult<()> {
        if subtask.assigned_worker.as_ref() != Some(&self.worker_id)
            || subtask.execution_token.is_none()
        {
            return Err(OrchestratorError::LeaseViolation(format!(
                "subtask {} is not assigned to {}",
                subtask.id(),
                self.worker_id
            )));
        }
        Ok(())
    }

    async fn transition(
        &self,
        subtask: &mut Subtask,
        to: SubtaskState,
        trigger: &str,
    ) -> OrchestratorResult<()> {
        let from = subtask.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::invalid_subtask_transition(from, to));
        }
        subtask.state = to;
        subtask.last_heartbeat_at = Some(Utc::now());
        subtask.state_version = self
            .store
            .update_subtask(subtask, subtask.state_version)
            .await?;
        self.store
            .append_transition(&TransitionRecord::for_subtask(subtask, from, to, trigger))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::events::InProcessEventBus;
    use crate::model::{Run, RunSettings, SubtaskKind};
    use crate::store::MemoryStore;

    async fn seed_queued_subtask(store: &MemoryStore) -> Subtask {
        let run = Run::new("acme".into(), json!({"q": "x"}), RunSettings::default());
        store.insert_run(&run).await.unwrap();
        let mut subtask = Subtask::new(
            run.id,
            0,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        );
        subtask.state = SubtaskState::Queued;
        store.insert_subtasks(&[subtask.clone()]).await.unwrap();
        subtask
    }

    fn client(store: &Arc<MemoryStore>, bus: &Arc<InProcessEventBus>, id: &str) -> WorkerClient {
        WorkerClient::new(store.clone(), bus.clone(), WorkerId(id.to_string()))
    }

    #[tokio::test]
    async fn only_one_worker_wins_a_claim() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessEventBus::new());
        let subtask = seed_queued_subtask(&store).await;

        let a = client(&store, &bus, "worker-a");
        let b = client(&store, &bus, "worker-b");

        let first = a.claim(subtask.id()).await.unwrap();
        let second = b.claim(subtask.id()).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(
            first.unwrap().assigned_worker,
            Some(WorkerId("worker-a".to_string()))
        );
    }

    #[tokio::test]
    async fn complete_requires_the_assigned_worker() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessEventBus::new());
        let subtask = seed_queued_subtask(&store).await;

        let a = client(&store, &bus, "worker-a");
        let intruder = client(&store, &bus, "worker-b");

        let mut claimed = a.claim(subtask.id()).await.unwrap().unwrap();
        a.start(&mut claimed).await.unwrap();

        let err = intruder
            .complete(&mut claimed.clone(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaseViolation(_)));

        a.complete(&mut claimed, json!({"ok": true})).await.unwrap();
        let stored = store.get_subtask(subtask.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, SubtaskState::Completed);
        assert_eq!(stored.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn fail_records_the_error_before_the_transition() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessEventBus::new());
        let subtask = seed_queued_subtask(&store).await;

        let a = client(&store, &bus, "worker-a");
        let mut claimed = a.claim(subtask.id()).await.unwrap().unwrap();
        a.start(&mut claimed).await.unwrap();
        a.fail(&mut claimed, "fetch_timeout", "source unreachable")
            .await
            .unwrap();

        let stored = store.get_subtask(subtask.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, SubtaskState::Failed);
        assert_eq!(stored.errors.len(), 1);
        assert_eq!(stored.errors[0].code, "fetch_timeout");
    }

    #[tokio::test]
    async fn cannot_start_without_claiming_first() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessEventBus::new());
        let mut subtask = seed_queued_subtask(&store).await;

        let a = client(&store, &bus, "worker-a");
        let err = a.start(&mut subtask).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaseViolation(_)));
    }

    #[tokio::test]
    async fn checkpoint_tags_the_producing_worker() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessEventBus::new());
        let subtask = seed_queued_subtask(&store).await;

        let a = client(&store, &bus, "worker-a");
        let mut claimed = a.claim(subtask.id()).await.unwrap().unwrap();
        a.start(&mut claimed).await.unwrap();
        a.checkpoint(&mut claimed, 2, json!({"cursor": "page-2"}))
            .await
            .unwrap();

        let stored = store.get_subtask(subtask.id()).await.unwrap().unwrap();
        let checkpoint = stored.checkpoint.unwrap();
        assert_eq!(checkpoint.step, 2);
        assert_eq!(checkpoint.worker, Some(WorkerId("worker-a".to_string())));
    }
}
