//! Idempotent event handlers for subtask completion and failure.
//!
//! Handlers never mutate the run's state machine; they reconcile counters,
//! mutate the affected subtask, and enqueue lifecycle ticks. Duplicate
//! delivery is harmless: every write here is either a reconciliation or a
//! version-conditioned transition with exactly one winner.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::events::{Event, EventHandler};
use crate::lifecycle::enqueue_tick;
use crate::model::{Run, RunState, Subtask, SubtaskState, TransitionRecord};
use crate::queue::JobQueue;
use crate::scheduler::SubtaskScheduler;
use crate::store::Store;

/// Reacts to `SubtaskCompleted`: reconcile counters, dispatch subtasks whose
/// dependency sets just became satisfied, and nudge the lifecycle once every
/// subtask is settled.
pub struct CompletionHandler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    scheduler: SubtaskScheduler,
}

impl CompletionHandler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = SubtaskScheduler::new(store.clone(), queue.clone(), config);
        Self {
            store,
            queue,
            scheduler,
        }
    }
}

#[async_trait]
impl EventHandler for CompletionHandler {
    fn name(&self) -> &'static str {
        "subtask_completion"
    }

    async fn handle(&self, event: &Event) -> OrchestratorResult<()> {
        let Some(run) = self.store.get_run(event.run_id).await? else {
            return Ok(());
        };
        if run.state.is_terminal() {
            return Ok(());
        }

        self.store.sync_progress(run.id).await?;

        // Past Executing the run no longer wants new dispatches; the counter
        // sync above is all a late completion contributes.
        if !matches!(run.state, RunState::Scheduling | RunState::Executing) {
            return Ok(());
        }

        let subtasks = self.store.list_subtasks(run.id).await?;
        let completed: BTreeSet<u32> = subtasks
            .iter()
            .filter(|subtask| subtask.state == SubtaskState::Completed)
            .map(|subtask| subtask.index)
            .collect();

        for subtask in &subtasks {
            if subtask.is_ready(&completed) {
                match self.scheduler.dispatch(&run, subtask, "dependency_completed").await {
                    Ok(_) => {
                        debug!(
                            subtask = %subtask.id(),
                            "dependencies satisfied, dispatched"
                        );
                    }
                    // Another handler or the lifecycle backstop won the write.
                    Err(err) if err.is_concurrency() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if subtasks.iter().all(|subtask| subtask.is_settled()) {
            enqueue_tick(&*self.queue, run.id, run.state_version, Duration::ZERO).await?;
        }
        Ok(())
    }
}

/// Reacts to `SubtaskFailed`: retry with backoff while attempts remain
/// (the one `Failed -> Pending` edge), otherwise settle the failure, skip
/// subtasks that can no longer become ready, and nudge the lifecycle so the
/// failure-ratio cutoff is evaluated under the run lease.
pub struct FailureHandler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    scheduler: SubtaskScheduler,
}

impl FailureHandler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = SubtaskScheduler::new(store.clone(), queue.clone(), config);
        Self {
            store,
            queue,
            scheduler,
        }
    }

    async fn retry(&self, run: &Run, subtask: &Subtask) -> OrchestratorResult<()> {
        let mut updated = subtask.clone();
        updated.attempt_count += 1;
        updated.state = SubtaskState::Pending;
        updated.assigned_worker = None;
        updated.execution_token = None;

        match self
            .store
            .update_subtask(&updated, subtask.state_version)
            .await
        {
            Ok(version) => {
                updated.state_version = version;
            }
            // Duplicate delivery: the reset already happened.
            Err(err) if err.is_concurrency() => return Ok(()),
            Err(err) => return Err(err),
        }
        self.store
            .append_transition(&TransitionRecord::for_subtask(
                &updated,
                SubtaskState::Failed,
                SubtaskState::Pending,
                "retry",
            ))
            .await?;

        info!(
            subtask = %updated.id(),
            attempt = updated.attempt_count,
            max_attempts = updated.max_attempts,
            "retrying failed subtask"
        );
        metrics::counter!("cairn_subtask_retries_total").increment(1);
        self.scheduler.dispatch(run, &updated, "retry").await?;
        Ok(())
    }

    async fn settle_permanent_failure(
        &self,
        run: &Run,
        subtask: &Subtask,
    ) -> OrchestratorResult<()> {
        // Persist the final attempt count so the failure is recognizably
        // exhausted; a version race means a duplicate delivery already did.
        let mut updated = subtask.clone();
        updated.attempt_count += 1;
        match self
            .store
            .update_subtask(&updated, subtask.state_version)
            .await
        {
            Ok(version) => updated.state_version = version,
            Err(err) if err.is_concurrency() => return Ok(()),
            Err(err) => return Err(err),
        }

        warn!(
            subtask = %updated.id(),
            attempts = updated.attempt_count,
            "subtask failed permanently"
        );
        metrics::counter!("cairn_subtasks_failed_permanently_total").increment(1);

        self.skip_unreachable(run).await?;
        self.store.sync_progress(run.id).await?;
        enqueue_tick(&*self.queue, run.id, run.state_version, Duration::ZERO).await?;
        Ok(())
    }

    /// Skip every pending subtask with a dependency that can no longer
    /// complete, iterating until the skip set stops growing.
    async fn skip_unreachable(&self, run: &Run) -> OrchestratorResult<()> {
        loop {
            let subtasks = self.store.list_subtasks(run.id).await?;
            let dead: BTreeSet<u32> = subtasks
                .iter()
                .filter(|subtask| {
                    subtask.is_settled() && subtask.state != SubtaskState::Completed
                })
                .map(|subtask| subtask.index)
                .collect();

            let mut changed = false;
            for subtask in &subtasks {
                if subtask.state != SubtaskState::Pending {
                    continue;
                }
                if subtask.depends_on.iter().any(|dep| dead.contains(dep)) {
                    let mut updated = subtask.clone();
                    updated.state = SubtaskState::Skipped;
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
                                    SubtaskState::Pending,
                                    SubtaskState::Skipped,
                                    "dependency_unreachable",
                                ))
                                .await?;
                            info!(subtask = %updated.id(), "skipped, dependency unreachable");
                            changed = true;
                        }
                        Err(err) if err.is_concurrency() => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl EventHandler for FailureHandler {
    fn name(&self) -> &'static str {
        "subtask_failure"
    }

    async fn handle(&self, event: &Event) -> OrchestratorResult<()> {
        let Some(id) = event.subtask else {
            return Ok(());
        };
        let Some(subtask) = self.store.get_subtask(id).await? else {
            return Ok(());
        };
        if subtask.state != SubtaskState::Failed {
            // Duplicate delivery after a reset, or the subtask moved on.
            return Ok(());
        }
        let Some(run) = self.store.get_run(event.run_id).await? else {
            return Ok(());
        };
        // A failure report for a run that already left Executing is stale;
        // retrying would enqueue work nobody is waiting for.
        if !matches!(run.state, RunState::Scheduling | RunState::Executing) {
            return Ok(());
        }

        if subtask.attempt_count + 1 < subtask.max_attempts {
            self.retry(&run, &subtask).await
        } else {
            self.settle_permanent_failure(&run, &subtask).await
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::config::LIFECYCLE_QUEUE;
    use crate::events::{EventBus, EventKind, InProcessEventBus};
    use crate::model::{RunId, RunSettings, SubtaskKind, WorkerId};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use crate::worker::WorkerClient;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        bus: Arc<InProcessEventBus>,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(InProcessEventBus::new());
        bus.subscribe(
            EventKind::SubtaskCompleted,
            Arc::new(CompletionHandler::new(
                store.clone(),
                queue.clone(),
                config.clone(),
            )),
        );
        bus.subscribe(
            EventKind::SubtaskFailed,
            Arc::new(FailureHandler::new(store.clone(), queue.clone(), config)),
        );
        Fixture { store, queue, bus }
    }

    async fn seed_run(f: &Fixture, plans: &[(SubtaskKind, &[u32])], max_attempts: u32) -> RunId {
        let mut run = Run::new("acme".into(), json!({"q": "x"}), RunSettings::default());
        run.state = crate::model::RunState::Executing;
        run.progress.total = plans.len() as u32;
        f.store.insert_run(&run).await.unwrap();

        let subtasks: Vec<Subtask> = plans
            .iter()
            .enumerate()
            .map(|(index, (kind, deps))| {
                let mut subtask = Subtask::new(
                    run.id,
                    index as u32,
                    *kind,
                    json!({}),
                    max_attempts,
                    deps.iter().copied().collect(),
                );
                if deps.is_empty() {
                    subtask.state = SubtaskState::Queued;
                }
                subtask
            })
            .collect();
        f.store.insert_subtasks(&subtasks).await.unwrap();
        run.id
    }

    fn worker(f: &Fixture, id: &str) -> WorkerClient {
        WorkerClient::new(f.store.clone(), f.bus.clone(), WorkerId(id.to_string()))
    }

    async fn run_to_failure(client: &WorkerClient, id: crate::model::SubtaskId) {
        let mut claimed = client.claim(id).await.unwrap().unwrap();
        client.start(&mut claimed).await.unwrap();
        client.fail(&mut claimed, "transient", "boom").await.unwrap();
    }

    #[tokio::test]
    async fn completion_unlocks_dependents_and_ticks_when_done() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(
            &f,
            &[
                (SubtaskKind::Research, &[]),
                (SubtaskKind::Research, &[]),
                (SubtaskKind::Research, &[]),
                (SubtaskKind::Synthesis, &[0, 1, 2]),
            ],
            3,
        )
        .await;

        let client = worker(&f, "w1");
        let subtasks = f.store.list_subtasks(run_id).await.unwrap();
        for subtask in subtasks.iter().take(2) {
            let mut claimed = client.claim(subtask.id()).await.unwrap().unwrap();
            client.start(&mut claimed).await.unwrap();
            client.complete(&mut claimed, json!({})).await.unwrap();
        }

        // Two of three dependencies done: the synthesis node must stay put.
        let synthesis = f.store.list_subtasks(run_id).await.unwrap()[3].clone();
        assert_eq!(synthesis.state, SubtaskState::Pending);

        let third = f.store.list_subtasks(run_id).await.unwrap()[2].clone();
        let mut claimed = client.claim(third.id()).await.unwrap().unwrap();
        client.start(&mut claimed).await.unwrap();
        client.complete(&mut claimed, json!({})).await.unwrap();

        let synthesis = f.store.list_subtasks(run_id).await.unwrap()[3].clone();
        assert_eq!(synthesis.state, SubtaskState::Queued);

        let run = f.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.progress.completed, 3);
    }

    #[tokio::test]
    async fn failure_retries_with_exponential_backoff_until_exhausted() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(&f, &[(SubtaskKind::Research, &[])], 3).await;
        let client = worker(&f, "w1");
        let id = crate::model::SubtaskId::new(run_id, 0);
        let queue_name = SubtaskKind::Research.queue_name();

        // Attempt 1 fails: retried with a 30 s delay.
        run_to_failure(&client, id).await;
        let subtask = f.store.get_subtask(id).await.unwrap().unwrap();
        assert_eq!(subtask.state, SubtaskState::Queued);
        assert_eq!(subtask.attempt_count, 1);
        let jobs = f.queue.drain(queue_name);
        let delay = (jobs[0].deliver_at - jobs[0].enqueued_at).num_seconds();
        assert!((29..=31).contains(&delay), "first retry delay was {delay}s");

        // Attempt 2 fails: retried with a 60 s delay.
        let mut claimed = client.claim(id).await.unwrap().unwrap();
        client.start(&mut claimed).await.unwrap();
        client.fail(&mut claimed, "transient", "boom").await.unwrap();
        let subtask = f.store.get_subtask(id).await.unwrap().unwrap();
        assert_eq!(subtask.state, SubtaskState::Queued);
        assert_eq!(subtask.attempt_count, 2);
        let jobs = f.queue.drain(queue_name);
        let delay = (jobs[0].deliver_at - jobs[0].enqueued_at).num_seconds();
        assert!((59..=61).contains(&delay), "second retry delay was {delay}s");

        // Attempt 3 fails: permanent, failed counter moves exactly once.
        let mut claimed = client.claim(id).await.unwrap().unwrap();
        client.start(&mut claimed).await.unwrap();
        client.fail(&mut claimed, "transient", "boom").await.unwrap();
        let subtask = f.store.get_subtask(id).await.unwrap().unwrap();
        assert_eq!(subtask.state, SubtaskState::Failed);
        assert_eq!(subtask.attempt_count, 3);
        assert_eq!(subtask.errors.len(), 3);

        let run = f.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.progress.failed, 1);

        // A lifecycle tick was enqueued so the run can react.
        assert!(f.queue.pending_count(LIFECYCLE_QUEUE) >= 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_dependents_transitively() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(
            &f,
            &[
                (SubtaskKind::Research, &[]),
                (SubtaskKind::Analysis, &[0]),
                (SubtaskKind::Synthesis, &[1]),
            ],
            1,
        )
        .await;

        let client = worker(&f, "w1");
        run_to_failure(&client, crate::model::SubtaskId::new(run_id, 0)).await;

        let subtasks = f.store.list_subtasks(run_id).await.unwrap();
        assert_eq!(subtasks[0].state, SubtaskState::Failed);
        assert_eq!(subtasks[1].state, SubtaskState::Skipped);
        assert_eq!(subtasks[2].state, SubtaskState::Skipped);

        let run = f.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.progress.failed, 1);
        assert_eq!(run.progress.skipped, 2);
    }

    #[tokio::test]
    async fn duplicate_failure_event_does_not_double_retry() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(&f, &[(SubtaskKind::Research, &[])], 3).await;
        let client = worker(&f, "w1");
        let id = crate::model::SubtaskId::new(run_id, 0);

        run_to_failure(&client, id).await;

        // Redeliver the same failure event by hand.
        f.bus
            .publish(crate::events::Event::subtask_failed(id, "transient", "boom"))
            .await
            .unwrap();

        let subtask = f.store.get_subtask(id).await.unwrap().unwrap();
        assert_eq!(subtask.attempt_count, 1, "no double increment");
        assert_eq!(
            f.queue.pending_count(SubtaskKind::Research.queue_name()),
            1,
            "no duplicate queue entry"
        );
    }

    #[tokio::test]
    async fn duplicate_completion_event_keeps_counters_exact() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(&f, &[(SubtaskKind::Research, &[])], 3).await;
        let client = worker(&f, "w1");
        let id = crate::model::SubtaskId::new(run_id, 0);

        let mut claimed = client.claim(id).await.unwrap().unwrap();
        client.start(&mut claimed).await.unwrap();
        client.complete(&mut claimed, json!({})).await.unwrap();

        f.bus
            .publish(crate::events::Event::subtask_completed(id))
            .await
            .unwrap();

        let run = f.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.progress.completed, 1);
    }

    #[tokio::test]
    async fn handler_ignores_events_for_terminal_runs() {
        let f = fixture(OrchestratorConfig::default());
        let run_id = seed_run(&f, &[(SubtaskKind::Research, &[])], 3).await;

        let mut run = f.store.get_run(run_id).await.unwrap().unwrap();
        run.state = crate::model::RunState::Cancelled;
        let version = run.state_version;
        f.store.update_run(&run, version, None).await.unwrap();

        let before: Vec<Value> = f
            .queue
            .snapshot(LIFECYCLE_QUEUE)
            .into_iter()
            .map(|job| job.payload)
            .collect();
        f.bus
            .publish(crate::events::Event::subtask_completed(
                crate::model::SubtaskId::new(run_id, 0),
            ))
            .await
            .unwrap();
        let after: Vec<Value> = f
            .queue
            .snapshot(LIFECYCLE_QUEUE)
            .into_iter()
            .map(|job| job.payload)
            .collect();
        assert_eq!(before, after);
    }
}
