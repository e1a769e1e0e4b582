//! Run lifecycle manager: the state-machine driver.
//!
//! `process(run_id)` is idempotent and safe to invoke concurrently and
//! redundantly. Each invocation acquires the run lease, executes exactly the
//! work of the run's current phase, persists any resulting transition
//! conditioned on the observed `state_version`, and releases the lease
//! unconditionally. Losing an optimistic-version race is not a failure; the
//! tick is re-enqueued with a short jittered delay and replayed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, ResultReducer};
use crate::config::{OrchestratorConfig, LIFECYCLE_QUEUE};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus, EventKind};
use crate::model::{
    LeaseToken, Run, RunId, RunOutcome, RunSettings, RunState, Subtask, SubtaskState, TenantId,
    TransitionRecord,
};
use crate::planner::{DecomposeRequest, Planner};
use crate::queue::JobQueue;
use crate::scheduler::SubtaskScheduler;
use crate::store::Store;
use serde_json::Value;

/// Caller-supplied finalization step (report generation, accounting) run
/// just before a run is marked completed.
#[async_trait]
pub trait FinalizeHook: Send + Sync {
    async fn finalize(&self, run: &Run) -> OrchestratorResult<()>;
}

/// Enqueue an idempotent lifecycle tick. The dedup key carries the observed
/// state version so a still-pending tick for an older phase never swallows
/// the tick that should run the next one.
pub async fn enqueue_tick(
    queue: &dyn JobQueue,
    run_id: RunId,
    state_version: i64,
    delay: Duration,
) -> OrchestratorResult<bool> {
    queue
        .enqueue(
            LIFECYCLE_QUEUE,
            &format!("tick-{run_id}"),
            json!({ "run_id": run_id }),
            50,
            delay,
            &format!("tick:{run_id}:v{state_version}"),
        )
        .await
}

pub struct RunLifecycleManager {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<dyn EventBus>,
    planner: Arc<dyn Planner>,
    scheduler: SubtaskScheduler,
    aggregator: Aggregator,
    finalize_hook: Option<Arc<dyn FinalizeHook>>,
    config: OrchestratorConfig,
    /// Lease-holder identity for this orchestrator process.
    holder: String,
}

impl RunLifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        bus: Arc<dyn EventBus>,
        planner: Arc<dyn Planner>,
        reducer: Arc<dyn ResultReducer>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = SubtaskScheduler::new(store.clone(), queue.clone(), config.clone());
        Self {
            store,
            queue,
            bus,
            planner,
            scheduler,
            aggregator: Aggregator::new(reducer),
            finalize_hook: None,
            config,
            holder: format!("orchestrator-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_finalize_hook(mut self, hook: Arc<dyn FinalizeHook>) -> Self {
        self.finalize_hook = Some(hook);
        self
    }

    pub fn scheduler(&self) -> &SubtaskScheduler {
        &self.scheduler
    }

    /// Create a run in `Created` and enqueue its first lifecycle tick.
    pub async fn submit(
        &self,
        tenant: TenantId,
        query: Value,
        settings: RunSettings,
    ) -> OrchestratorResult<RunId> {
        let run = Run::new(tenant, query, settings);
        self.store.insert_run(&run).await?;
        enqueue_tick(&*self.queue, run.id, run.state_version, Duration::ZERO).await?;
        info!(run_id = %run.id, tenant = %run.tenant, "run submitted");
        metrics::counter!("cairn_runs_submitted_total").increment(1);
        Ok(run.id)
    }

    /// One idempotent lifecycle tick. Returns without error when the run does
    /// not exist or another process holds the lease.
    pub async fn process(&self, run_id: RunId) -> OrchestratorResult<()> {
        let Some(token) = self
            .store
            .acquire_run_lease(run_id, &self.holder, self.config.lease_ttl)
            .await?
        else {
            // Another holder owns the run right now. The pulled tick must not
            // be lost, so it comes back after a short delay; the chain stops
            // once the run is terminal.
            debug!(run_id = %run_id, "lease unavailable, deferring tick");
            return self.requeue_tick_soon(run_id).await;
        };

        let outcome = self.step_under_lease(run_id, token).await;

        // Lease release happens no matter how the step ended.
        if let Err(err) = self.store.release_run_lease(run_id, token).await {
            warn!(run_id = %run_id, error = %err, "lease release failed");
        }

        match outcome {
            Err(err) if err.is_concurrency() => {
                metrics::counter!("cairn_lifecycle_conflicts_total").increment(1);
                debug!(run_id = %run_id, "lost version race, requeueing tick");
                self.requeue_tick_soon(run_id).await
            }
            other => other,
        }
    }

    /// Cancel a run: terminal, best-effort. A no-op when the lease is held
    /// elsewhere or the run is already terminal.
    pub async fn cancel(&self, run_id: RunId, reason: &str) -> OrchestratorResult<()> {
        let Some(token) = self
            .store
            .acquire_run_lease(run_id, &self.holder, self.config.lease_ttl)
            .await?
        else {
            return Ok(());
        };

        let outcome = async {
            let Some(mut run) = self.store.get_run(run_id).await? else {
                return Ok(());
            };
            if run.state.is_terminal() {
                return Ok(());
            }
            self.cancel_open_subtasks(&mut run, "run_cancelled").await?;
            run.outcome = Some(RunOutcome {
                summary: json!({ "cancelled": reason }),
                artifacts: Vec::new(),
            });
            self.advance(&mut run, RunState::Cancelled, &token).await
        }
        .await;

        if let Err(err) = self.store.release_run_lease(run_id, token).await {
            warn!(run_id = %run_id, error = %err, "lease release failed");
        }
        outcome
    }

    async fn requeue_tick_soon(&self, run_id: RunId) -> OrchestratorResult<()> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(());
        };
        if run.state.is_terminal() {
            return Ok(());
        }
        let base = self.config.conflict_retry_delay;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
        let _ = enqueue_tick(
            &*self.queue,
            run_id,
            run.state_version,
            base + Duration::from_millis(jitter),
        )
        .await?;
        Ok(())
    }

    async fn step_under_lease(&self, run_id: RunId, token: LeaseToken) -> OrchestratorResult<()> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            return Ok(());
        };
        if run.state.is_terminal() {
            debug!(run_id = %run_id, state = %run.state, "run already terminal");
            return Ok(());
        }

        match self.execute_phase(&mut run).await {
            Ok(None) => Ok(()),
            Ok(Some(next)) => self.advance(&mut run, next, &token).await,
            Err(err) if err.is_non_retryable() => {
                warn!(run_id = %run_id, error = %err, "run failed in phase {}", run.state);
                self.fail_run(&mut run, &token, &err.to_string()).await
            }
            Err(err) => Err(err),
        }
    }

    /// The work of the run's current phase. Returns the target state, or
    /// `None` when the phase is still waiting on external progress.
    async fn execute_phase(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        match run.state {
            RunState::Created => Ok(Some(RunState::Validating)),
            RunState::Validating => self.phase_validate(run).await,
            RunState::Decomposing => self.phase_decompose(run).await,
            RunState::Scheduling => self.phase_schedule(run).await,
            RunState::Executing => self.phase_execute(run).await,
            RunState::Aggregating => self.phase_aggregate(run).await,
            RunState::Finalizing => self.phase_finalize(run).await,
            RunState::Completed | RunState::Failed | RunState::Cancelled => Ok(None),
        }
    }

    async fn phase_validate(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        let verdict = self.planner.validate(&run.query).await?;
        if !verdict.valid {
            return Err(OrchestratorError::Validation(
                verdict.reason.unwrap_or_else(|| "query rejected".to_string()),
            ));
        }

        if !self.config.dedup_window.is_zero() {
            let since = Utc::now()
                - chrono::Duration::from_std(self.config.dedup_window).unwrap_or_default();
            if let Some(original) = self
                .store
                .find_recent_run_by_digest(&run.query_digest(), since, run.id)
                .await?
            {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate of recent run {original}"
                )));
            }
        }

        Ok(Some(RunState::Decomposing))
    }

    async fn phase_decompose(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        // A crashed predecessor may have persisted the batch already; the
        // phase replays as a no-op.
        let existing = self.store.list_subtasks(run.id).await?;
        if !existing.is_empty() {
            run.progress.total = existing.len() as u32;
            return Ok(Some(RunState::Scheduling));
        }

        let request = DecomposeRequest {
            query: run.query.clone(),
            max_subtasks: run.settings.max_subtasks,
            budget_ceiling: run.settings.budget_ceiling,
        };
        let mut plan = self.planner.decompose(&request).await?;
        if plan.subtasks.is_empty() {
            return Err(OrchestratorError::Decomposition(
                "planner returned no subtasks".to_string(),
            ));
        }
        if plan.subtasks.len() as u32 > run.settings.max_subtasks {
            // Truncating would silently drop dependency edges, so ask again
            // with the cap spelled out instead.
            warn!(
                run_id = %run.id,
                produced = plan.subtasks.len(),
                cap = run.settings.max_subtasks,
                "plan exceeds subtask cap, re-invoking planner"
            );
            plan = self.planner.decompose(&request).await?;
            if plan.subtasks.len() as u32 > run.settings.max_subtasks {
                return Err(OrchestratorError::Decomposition(format!(
                    "planner produced {} subtasks, cap is {}",
                    plan.subtasks.len(),
                    run.settings.max_subtasks
                )));
            }
            if plan.subtasks.is_empty() {
                return Err(OrchestratorError::Decomposition(
                    "planner returned no subtasks".to_string(),
                ));
            }
        }
        plan.validate()?;

        let subtasks: Vec<Subtask> = plan
            .subtasks
            .iter()
            .enumerate()
            .map(|(index, planned)| {
                Subtask::new(
                    run.id,
                    index as u32,
                    planned.kind,
                    planned.input.clone(),
                    run.settings.max_attempts,
                    planned.depends_on.clone(),
                )
            })
            .collect();
        self.store.insert_subtasks(&subtasks).await?;
        run.progress.total = subtasks.len() as u32;
        info!(
            run_id = %run.id,
            subtasks = subtasks.len(),
            edges = plan.dependency_edges().len(),
            "run decomposed"
        );
        Ok(Some(RunState::Scheduling))
    }

    async fn phase_schedule(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        self.dispatch_ready(run, "scheduling").await?;
        Ok(Some(RunState::Executing))
    }

    async fn phase_execute(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        let now = Utc::now();
        if run.is_past_deadline(now) {
            info!(run_id = %run.id, "deadline passed, cancelling open subtasks");
            self.cancel_open_subtasks(run, "deadline").await?;
            return Ok(Some(RunState::Aggregating));
        }

        if run.failed_fraction() > self.config.failure_ratio_threshold {
            run.outcome = Some(RunOutcome {
                summary: json!({
                    "error": format!(
                        "{} of {} subtasks failed permanently",
                        run.progress.failed, run.progress.total
                    ),
                }),
                artifacts: Vec::new(),
            });
            return Ok(Some(RunState::Failed));
        }

        // Dispatch anything that became ready since the last tick; completion
        // handlers do this eagerly, this is the periodic backstop.
        self.dispatch_ready(run, "executing").await?;

        let subtasks = self.store.list_subtasks(run.id).await?;
        if subtasks.iter().all(|subtask| subtask.is_settled()) {
            return Ok(Some(RunState::Aggregating));
        }
        Ok(None)
    }

    async fn phase_aggregate(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        let subtasks = self.store.list_subtasks(run.id).await?;
        let outcome = self.aggregator.aggregate(run, &subtasks).await?;
        run.outcome = Some(outcome);
        Ok(Some(RunState::Finalizing))
    }

    async fn phase_finalize(&self, run: &mut Run) -> OrchestratorResult<Option<RunState>> {
        if let Some(hook) = &self.finalize_hook {
            hook.finalize(run).await?;
        }
        Ok(Some(RunState::Completed))
    }

    /// Dispatch every pending subtask whose dependencies are all completed.
    async fn dispatch_ready(&self, run: &Run, trigger: &str) -> OrchestratorResult<usize> {
        let subtasks = self.store.list_subtasks(run.id).await?;
        let completed: std::collections::BTreeSet<u32> = subtasks
            .iter()
            .filter(|subtask| subtask.state == SubtaskState::Completed)
            .map(|subtask| subtask.index)
            .collect();

        let mut dispatched = 0;
        for subtask in &subtasks {
            if subtask.is_ready(&completed) {
                match self.scheduler.dispatch(run, subtask, trigger).await {
                    Ok(_) => dispatched += 1,
                    // Someone else dispatched it between our scan and write.
                    Err(err) if err.is_concurrency() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(dispatched)
    }

    /// Cancel every still-pending/queued subtask, then fold the counter bumps
    /// back into our view of the run so the next conditional write carries
    /// the current version.
    async fn cancel_open_subtasks(&self, run: &mut Run, trigger: &str) -> OrchestratorResult<()> {
        let subtasks = self.store.list_subtasks(run.id).await?;
        for subtask in &subtasks {
            if !subtask.state.can_transition_to(SubtaskState::Cancelled) {
                continue;
            }
            let from = subtask.state;
            let mut updated = subtask.clone();
            updated.state = SubtaskState::Cancelled;
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
                            SubtaskState::Cancelled,
                            trigger,
                        ))
                        .await?;
                }
                // Raced with a worker claim or report; the next tick sees the
                // subtask's real state.
                Err(err) if err.is_concurrency() => {}
                Err(err) => return Err(err),
            }
        }
        self.store.sync_progress(run.id).await?;
        self.refresh(run).await
    }

    async fn refresh(&self, run: &mut Run) -> OrchestratorResult<()> {
        if let Some(fresh) = self.store.get_run(run.id).await? {
            run.state_version = fresh.state_version;
            run.progress = fresh.progress;
        }
        Ok(())
    }

    async fn fail_run(
        &self,
        run: &mut Run,
        token: &LeaseToken,
        reason: &str,
    ) -> OrchestratorResult<()> {
        run.outcome = Some(RunOutcome {
            summary: json!({ "error": reason }),
            artifacts: Vec::new(),
        });
        self.advance(run, RunState::Failed, token).await
    }

    /// Validate the transition against the table, persist it conditioned on
    /// the observed version, append the audit row, publish terminal events,
    /// and re-enqueue the next tick for short phases.
    async fn advance(
        &self,
        run: &mut Run,
        to: RunState,
        token: &LeaseToken,
    ) -> OrchestratorResult<()> {
        let from = run.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::invalid_run_transition(from, to));
        }

        let now = Utc::now();
        run.state = to;
        if to == RunState::Executing && run.started_at.is_none() {
            run.started_at = Some(now);
            run.deadline_at =
                Some(now + chrono::Duration::seconds(run.settings.timeout_seconds));
        }
        if to.is_terminal() {
            run.completed_at = Some(now);
        }

        let expected = run.state_version;
        run.state_version = self.store.update_run(run, expected, Some(token)).await?;
        self.store
            .append_transition(&TransitionRecord::for_run(run, from, to, "lifecycle"))
            .await?;

        info!(
            run_id = %run.id,
            from = from.as_str(),
            to = to.as_str(),
            version = run.state_version,
            "run advanced"
        );

        match to {
            RunState::Completed => {
                let duration_ms = run
                    .started_at
                    .zip(run.completed_at)
                    .map(|(start, end)| (end - start).num_milliseconds())
                    .unwrap_or(0);
                info!(run_id = %run.id, duration_ms, "run completed");
                metrics::counter!("cairn_runs_completed_total").increment(1);
                self.bus
                    .publish(Event::run_terminal(
                        EventKind::RunCompleted,
                        run.id,
                        json!({ "duration_ms": duration_ms }),
                    ))
                    .await?;
            }
            RunState::Failed => {
                metrics::counter!("cairn_runs_failed_total").increment(1);
                self.bus
                    .publish(Event::run_terminal(
                        EventKind::RunFailed,
                        run.id,
                        run.outcome
                            .as_ref()
                            .map(|outcome| outcome.summary.clone())
                            .unwrap_or(Value::Null),
                    ))
                    .await?;
            }
            RunState::Cancelled => {
                metrics::counter!("cairn_runs_cancelled_total").increment(1);
                self.bus
                    .publish(Event::run_terminal(
                        EventKind::RunCancelled,
                        run.id,
                        Value::Null,
                    ))
                    .await?;
            }
            _ => {}
        }

        // Executing waits on workers; everything else should run promptly.
        if !to.is_terminal() && to != RunState::Executing {
            enqueue_tick(&*self.queue, run.id, run.state_version, Duration::ZERO).await?;
        }
        Ok(())
    }
}
