//! Subtask dispatch decisions.
//!
//! Priority, backoff, and fairness are pure functions over the run, the
//! subtask, and a store-queried window of recent dispatch history; nothing
//! here keeps in-process counters, so the math is identical no matter how
//! many orchestrator processes are running.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Run, Subtask, SubtaskState, TenantId, TransitionRecord, WorkerId};
use crate::queue::JobQueue;
use crate::store::{DispatchWindow, Store};

/// Concrete dispatch decision for one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub queue: &'static str,
    /// Queue priority, 1 (lowest) to 100 (highest).
    pub priority: u8,
    pub delay: Duration,
    /// Best-effort placement hint when resuming from a checkpoint; any
    /// worker must still be able to resume from the persisted state.
    pub worker_affinity: Option<WorkerId>,
}

/// Exponential backoff: zero on the first attempt, then
/// `min(base * 2^(attempts-1), cap)`.
pub fn backoff_delay(attempt_count: u32, base: Duration, cap: Duration) -> Duration {
    if attempt_count == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempt_count - 1).min(20);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// 0.8x when the tenant is above its fair share of the recent dispatch
/// window, 1.2x when under, 1.0x otherwise (including an empty window).
pub fn fairness_multiplier(tenant: &TenantId, window: &DispatchWindow) -> f64 {
    if window.total == 0 || window.tenant_count() == 0 {
        return 1.0;
    }
    let fair_share = window.total as f64 / window.tenant_count() as f64;
    let used = window.for_tenant(tenant) as f64;
    if used > fair_share {
        0.8
    } else if used < fair_share {
        1.2
    } else {
        1.0
    }
}

/// Priority formula: `run.priority * 10`, boosted as the deadline nears,
/// penalized per prior attempt so retries never starve fresh work, scaled by
/// the tenant-fairness multiplier, clamped to [1, 100].
pub fn compute_priority(
    run: &Run,
    subtask: &Subtask,
    window: &DispatchWindow,
    config: &OrchestratorConfig,
    now: DateTime<Utc>,
) -> u8 {
    let mut priority = run.settings.priority as i32 * 10;

    if let Some(deadline) = run.deadline_at {
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        for (threshold, boost) in config.deadline_boosts {
            if remaining <= threshold {
                priority = run.settings.priority as i32 * 10 + boost;
            }
        }
    }

    priority -= 5 * subtask.attempt_count as i32;

    let adjusted = (priority as f64 * fairness_multiplier(&run.tenant, window)).round() as i32;
    adjusted.clamp(1, 100) as u8
}

pub struct SubtaskScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    config: OrchestratorConfig,
}

impl SubtaskScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Compute a dispatch decision without side effects.
    pub async fn schedule(
        &self,
        run: &Run,
        subtask: &Subtask,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<DispatchDecision> {
        let since = now
            - chrono::Duration::from_std(self.config.fairness_window).unwrap_or_default();
        let window = self.store.dispatch_window(since).await?;
        Ok(DispatchDecision {
            queue: subtask.kind.queue_name(),
            priority: compute_priority(run, subtask, &window, &self.config, now),
            delay: backoff_delay(
                subtask.attempt_count,
                self.config.backoff_base,
                self.config.backoff_cap,
            ),
            worker_affinity: subtask
                .checkpoint
                .as_ref()
                .and_then(|checkpoint| checkpoint.worker.clone()),
        })
    }

    /// Full dispatch of a `Pending` subtask: enqueue under its idempotency
    /// key, transition it to `Queued`, append the audit row, and record the
    /// tenant dispatch for fairness accounting. Safe to call redundantly; the
    /// dedup key collapses repeated enqueues and the version check makes the
    /// transition single-winner.
    pub async fn dispatch(
        &self,
        run: &Run,
        subtask: &Subtask,
        trigger: &str,
    ) -> OrchestratorResult<DispatchDecision> {
        let now = Utc::now();
        let decision = self.schedule(run, subtask, now).await?;

        if !subtask.state.can_transition_to(SubtaskState::Queued) {
            return Err(OrchestratorError::invalid_subtask_transition(
                subtask.state,
                SubtaskState::Queued,
            ));
        }

        let payload = json!({
            "run_id": subtask.run_id,
            "index": subtask.index,
            "kind": subtask.kind.as_str(),
            "attempt": subtask.attempt_count,
            "worker_affinity": decision.worker_affinity,
        });
        let enqueued = self
            .queue
            .enqueue(
                decision.queue,
                &subtask.id().to_string(),
                payload,
                decision.priority,
                decision.delay,
                &subtask.idempotency_key(),
            )
            .await?;
        if !enqueued {
            debug!(subtask = %subtask.id(), "dispatch collapsed onto pending queue entry");
        }

        let from = subtask.state;
        let mut updated = subtask.clone();
        updated.state = SubtaskState::Queued;
        updated.state_version = self
            .store
            .update_subtask(&updated, subtask.state_version)
            .await?;
        self.store
            .append_transition(&TransitionRecord::for_subtask(
                &updated,
                from,
                SubtaskState::Queued,
                trigger,
            ))
            .await?;
        self.store.record_dispatch(&run.tenant).await?;

        metrics::counter!("cairn_subtasks_dispatched_total").increment(1);
        debug!(
            subtask = %subtask.id(),
            queue = decision.queue,
            priority = decision.priority,
            delay_ms = decision.delay.as_millis() as u64,
            "subtask dispatched"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::model::{Checkpoint, RunSettings, SubtaskKind};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;

    fn test_run(priority: u8) -> Run {
        Run::new(
            "acme".into(),
            json!({"q": "quarterly revenue analysis"}),
            RunSettings {
                priority,
                ..RunSettings::default()
            },
        )
    }

    fn test_subtask(run: &Run, index: u32) -> Subtask {
        Subtask::new(
            run.id,
            index,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        )
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    #[test]
    fn base_priority_is_run_priority_times_ten() {
        let run = test_run(5);
        let subtask = test_subtask(&run, 0);
        let priority = compute_priority(
            &run,
            &subtask,
            &DispatchWindow::default(),
            &config(),
            Utc::now(),
        );
        assert_eq!(priority, 50);
    }

    #[test]
    fn deadline_boosts_escalate_as_time_runs_out() {
        let mut run = test_run(5);
        let subtask = test_subtask(&run, 0);
        let now = Utc::now();

        run.deadline_at = Some(now + chrono::Duration::minutes(60));
        assert_eq!(
            compute_priority(&run, &subtask, &DispatchWindow::default(), &config(), now),
            50
        );

        run.deadline_at = Some(now + chrono::Duration::minutes(10));
        assert_eq!(
            compute_priority(&run, &subtask, &DispatchWindow::default(), &config(), now),
            60
        );

        run.deadline_at = Some(now + chrono::Duration::minutes(2));
        assert_eq!(
            compute_priority(&run, &subtask, &DispatchWindow::default(), &config(), now),
            70
        );
    }

    #[test]
    fn attempts_are_penalized_so_retries_never_starve_fresh_work() {
        let run = test_run(5);
        let mut subtask = test_subtask(&run, 0);
        subtask.attempt_count = 2;
        let priority = compute_priority(
            &run,
            &subtask,
            &DispatchWindow::default(),
            &config(),
            Utc::now(),
        );
        assert_eq!(priority, 40);
    }

    #[test]
    fn fairness_multiplier_rewards_underserved_tenants() {
        let mut window = DispatchWindow::default();
        window.per_tenant.insert("acme".into(), 9);
        window.per_tenant.insert("globex".into(), 1);
        window.total = 10;

        assert!((fairness_multiplier(&"acme".into(), &window) - 0.8).abs() < f64::EPSILON);
        assert!((fairness_multiplier(&"globex".into(), &window) - 1.2).abs() < f64::EPSILON);
        assert!((fairness_multiplier(&"initech".into(), &window) - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_window_is_neutral() {
        assert!(
            (fairness_multiplier(&"acme".into(), &DispatchWindow::default()) - 1.0).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn priority_is_clamped_to_valid_range() {
        let run = test_run(10);
        let mut subtask = test_subtask(&run, 0);
        let mut window = DispatchWindow::default();
        window.per_tenant.insert("acme".into(), 1);
        window.per_tenant.insert("globex".into(), 9);
        window.total = 10;

        // 100 * 1.2 clamps back down to 100.
        let high = compute_priority(&run, &subtask, &window, &config(), Utc::now());
        assert_eq!(high, 100);

        // Heavy retry penalty on a low-priority run clamps up to 1.
        let low_run = test_run(1);
        subtask.attempt_count = 10;
        let low = compute_priority(
            &low_run,
            &subtask,
            &DispatchWindow::default(),
            &config(),
            Utc::now(),
        );
        assert_eq!(low, 1);
    }

    #[test]
    fn backoff_doubles_from_base_and_hits_the_cap() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(0, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(240));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(300));
        assert_eq!(backoff_delay(12, base, cap), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn affinity_is_set_only_when_resuming_from_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let scheduler = SubtaskScheduler::new(store, queue, config());

        let run = test_run(5);
        let mut subtask = test_subtask(&run, 0);
        let decision = scheduler.schedule(&run, &subtask, Utc::now()).await.unwrap();
        assert!(decision.worker_affinity.is_none());

        subtask.checkpoint = Some(Checkpoint {
            step: 4,
            state: json!({"cursor": "p4"}),
            worker: Some(WorkerId("worker-7".to_string())),
        });
        let resumed = scheduler.schedule(&run, &subtask, Utc::now()).await.unwrap();
        assert_eq!(resumed.worker_affinity, Some(WorkerId("worker-7".to_string())));
    }

    #[tokio::test]
    async fn redundant_dispatch_collapses_to_one_queue_entry() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let scheduler = SubtaskScheduler::new(store.clone(), queue.clone(), config());

        let run = test_run(5);
        store.insert_run(&run).await.unwrap();
        let subtask = test_subtask(&run, 0);
        store.insert_subtasks(&[subtask.clone()]).await.unwrap();

        scheduler.dispatch(&run, &subtask, "test").await.unwrap();

        // A crash-and-retry of the scheduling phase replays the dispatch with
        // the subtask still in its pre-transition shape.
        let replay = scheduler.dispatch(&run, &subtask, "test").await;
        assert!(replay.unwrap_err().is_concurrency());
        assert_eq!(queue.pending_count(SubtaskKind::Research.queue_name()), 1);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn priority_is_always_in_1_to_100(
                run_priority in 1u8..=10,
                attempts in 0u32..32,
                tenant_hits in 0u64..100,
                other_hits in 0u64..100,
                minutes_left in 0i64..180,
            ) {
                let mut run = test_run(run_priority);
                let now = Utc::now();
                run.deadline_at = Some(now + chrono::Duration::minutes(minutes_left));
                let mut subtask = test_subtask(&run, 0);
                subtask.attempt_count = attempts;

                let mut window = DispatchWindow::default();
                window.per_tenant.insert("acme".into(), tenant_hits);
                window.per_tenant.insert("globex".into(), other_hits);
                window.total = tenant_hits + other_hits;

                let priority = compute_priority(&run, &subtask, &window, &config(), now);
                prop_assert!((1..=100).contains(&priority));
            }

            #[test]
            fn backoff_is_monotone_and_capped(
                attempts in 0u32..64,
                base_secs in 0u64..120,
                cap_secs in 1u64..600,
            ) {
                let base = Duration::from_secs(base_secs);
                let cap = Duration::from_secs(cap_secs);
                let delay = backoff_delay(attempts, base, cap);
                prop_assert!(delay <= cap);
                if attempts > 0 {
                    prop_assert!(delay >= backoff_delay(attempts - 1, base, cap).min(cap));
                }
            }
        }
    }

    #[tokio::test]
    async fn dispatch_marks_the_subtask_queued_and_records_history() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let scheduler = SubtaskScheduler::new(store.clone(), queue, config());

        let run = test_run(5);
        store.insert_run(&run).await.unwrap();
        let subtask = test_subtask(&run, 0);
        store.insert_subtasks(&[subtask.clone()]).await.unwrap();

        scheduler.dispatch(&run, &subtask, "scheduling").await.unwrap();

        let stored = store.get_subtask(subtask.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, SubtaskState::Queued);

        let window = store
            .dispatch_window(Utc::now() - chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(window.for_tenant(&"acme".into()), 1);
    }
}
