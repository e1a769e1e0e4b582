//! In-memory store for tests and single-process deployments.
//!
//! Mirrors the Postgres implementation's conditional-update semantics
//! exactly; every guard the SQL expresses is enforced here too, so tests
//! against this store exercise the same failure modes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    LeaseToken, Run, RunId, RunLease, RunProgress, Subtask, SubtaskId, SubtaskState, TenantId,
    TransitionEntity, TransitionRecord,
};

use super::{DispatchWindow, Store};

#[derive(Default)]
struct State {
    runs: HashMap<RunId, Run>,
    subtasks: HashMap<RunId, BTreeMap<u32, Subtask>>,
    transitions: Vec<TransitionRecord>,
    dispatches: Vec<(TenantId, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All transitions recorded so far. Test helper.
    pub fn all_transitions(&self) -> Vec<TransitionRecord> {
        self.state.lock().expect("store poisoned").transitions.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_run(&self, run: &Run) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store poisoned");
        if state.runs.contains_key(&run.id) {
            return Err(OrchestratorError::Store(format!(
                "run {} already exists",
                run.id
            )));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> OrchestratorResult<Option<Run>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state.runs.get(&id).cloned())
    }

    async fn update_run(
        &self,
        run: &Run,
        expected_version: i64,
        lease: Option<&LeaseToken>,
    ) -> OrchestratorResult<i64> {
        let mut state = self.state.lock().expect("store poisoned");
        let stored = state
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {}", run.id)))?;

        if stored.state_version != expected_version {
            return Err(OrchestratorError::Concurrency(format!("run {}", run.id)));
        }
        if let Some(held) = &stored.lease {
            if !held.is_expired(Utc::now()) && lease != Some(&held.token) {
                return Err(OrchestratorError::LeaseViolation(run.id.to_string()));
            }
        }

        let kept_lease = stored.lease.clone();
        *stored = run.clone();
        stored.lease = kept_lease;
        stored.state_version = expected_version + 1;
        Ok(stored.state_version)
    }

    async fn acquire_run_lease(
        &self,
        id: RunId,
        holder: &str,
        ttl: Duration,
    ) -> OrchestratorResult<Option<LeaseToken>> {
        let mut state = self.state.lock().expect("store poisoned");
        let Some(stored) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        let now = Utc::now();
        if let Some(held) = &stored.lease {
            if !held.is_expired(now) {
                return Ok(None);
            }
        }
        let token = LeaseToken::new();
        stored.lease = Some(RunLease {
            token,
            holder: holder.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        });
        stored.state_version += 1;
        Ok(Some(token))
    }

    async fn release_run_lease(&self, id: RunId, token: LeaseToken) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store poisoned");
        let Some(stored) = state.runs.get_mut(&id) else {
            return Ok(());
        };
        if stored.lease.as_ref().map(|l| l.token) == Some(token) {
            stored.lease = None;
            stored.state_version += 1;
        }
        Ok(())
    }

    async fn sync_progress(&self, id: RunId) -> OrchestratorResult<RunProgress> {
        let mut state = self.state.lock().expect("store poisoned");
        let mut progress = RunProgress::default();
        if let Some(per_run) = state.subtasks.get(&id) {
            for subtask in per_run.values() {
                progress.total += 1;
                match subtask.state {
                    SubtaskState::Completed => progress.completed += 1,
                    SubtaskState::Failed if !subtask.retries_remaining() => progress.failed += 1,
                    SubtaskState::Skipped => progress.skipped += 1,
                    SubtaskState::Cancelled => progress.cancelled += 1,
                    _ => {}
                }
            }
        }
        let stored = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {id}")))?;
        stored.progress = progress;
        stored.state_version += 1;
        Ok(progress)
    }

    async fn insert_subtasks(&self, subtasks: &[Subtask]) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store poisoned");
        for subtask in subtasks {
            let per_run = state.subtasks.entry(subtask.run_id).or_default();
            if per_run.contains_key(&subtask.index) {
                return Err(OrchestratorError::Store(format!(
                    "subtask {} already exists",
                    subtask.id()
                )));
            }
        }
        for subtask in subtasks {
            state
                .subtasks
                .entry(subtask.run_id)
                .or_default()
                .insert(subtask.index, subtask.clone());
        }
        Ok(())
    }

    async fn get_subtask(&self, id: SubtaskId) -> OrchestratorResult<Option<Subtask>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .subtasks
            .get(&id.run_id)
            .and_then(|per_run| per_run.get(&id.index))
            .cloned())
    }

    async fn list_subtasks(&self, run_id: RunId) -> OrchestratorResult<Vec<Subtask>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .subtasks
            .get(&run_id)
            .map(|per_run| per_run.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_subtask(
        &self,
        subtask: &Subtask,
        expected_version: i64,
    ) -> OrchestratorResult<i64> {
        let mut state = self.state.lock().expect("store poisoned");
        let stored = state
            .subtasks
            .get_mut(&subtask.run_id)
            .and_then(|per_run| per_run.get_mut(&subtask.index))
            .ok_or_else(|| OrchestratorError::NotFound(format!("subtask {}", subtask.id())))?;

        if stored.state_version != expected_version {
            return Err(OrchestratorError::Concurrency(format!(
                "subtask {}",
                subtask.id()
            )));
        }
        *stored = subtask.clone();
        stored.state_version = expected_version + 1;
        Ok(stored.state_version)
    }

    async fn executing_runs_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<RunId>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .runs
            .values()
            .filter(|run| {
                run.state == crate::model::RunState::Executing && run.is_past_deadline(now)
            })
            .take(limit.max(0) as usize)
            .map(|run| run.id)
            .collect())
    }

    async fn stalled_subtasks(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<Subtask>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .subtasks
            .values()
            .flat_map(|per_run| per_run.values())
            .filter(|subtask| {
                matches!(
                    subtask.state,
                    SubtaskState::Assigned | SubtaskState::Running
                ) && subtask
                    .last_heartbeat_at
                    .map(|at| at < heartbeat_before)
                    .unwrap_or(true)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn active_runs(&self, limit: i64) -> OrchestratorResult<Vec<Run>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .runs
            .values()
            .filter(|run| !run.state.is_terminal())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_dispatch(&self, tenant: &TenantId) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store poisoned");
        state.dispatches.push((tenant.clone(), Utc::now()));
        Ok(())
    }

    async fn dispatch_window(&self, since: DateTime<Utc>) -> OrchestratorResult<DispatchWindow> {
        let mut state = self.state.lock().expect("store poisoned");
        // Entries older than the window are dead weight; drop them on read.
        state.dispatches.retain(|(_, at)| *at >= since);
        let mut window = DispatchWindow::default();
        for (tenant, _) in &state.dispatches {
            *window.per_tenant.entry(tenant.clone()).or_default() += 1;
            window.total += 1;
        }
        Ok(window)
    }

    async fn append_transition(&self, record: &TransitionRecord) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store poisoned");
        state.transitions.push(record.clone());
        Ok(())
    }

    async fn transitions_for_run(
        &self,
        run_id: RunId,
    ) -> OrchestratorResult<Vec<TransitionRecord>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .transitions
            .iter()
            .filter(|record| match &record.entity {
                TransitionEntity::Run(id) => *id == run_id,
                TransitionEntity::Subtask(id) => id.run_id == run_id,
            })
            .cloned()
            .collect())
    }

    async fn find_recent_run_by_digest(
        &self,
        digest: &str,
        since: DateTime<Utc>,
        exclude: RunId,
    ) -> OrchestratorResult<Option<RunId>> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .runs
            .values()
            .filter(|run| {
                run.id != exclude && run.created_at >= since && run.query_digest() == digest
            })
            .max_by_key(|run| run.created_at)
            .map(|run| run.id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::model::{RunSettings, SubtaskKind};

    fn run() -> Run {
        Run::new(
            "acme".into(),
            json!({"q": "test"}),
            RunSettings::default(),
        )
    }

    #[tokio::test]
    async fn update_run_rejects_stale_version() {
        let store = MemoryStore::new();
        let mut r = run();
        store.insert_run(&r).await.unwrap();

        let v = r.state_version;
        r.state = crate::model::RunState::Validating;
        let new_version = store.update_run(&r, v, None).await.unwrap();
        assert_eq!(new_version, v + 1);

        // Replaying the same expected version loses the race.
        let err = store.update_run(&r, v, None).await.unwrap_err();
        assert!(err.is_concurrency());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let r = run();
        store.insert_run(&r).await.unwrap();

        let token = store
            .acquire_run_lease(r.id, "proc-a", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire wins");
        let contender = store
            .acquire_run_lease(r.id, "proc-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(contender.is_none());

        store.release_run_lease(r.id, token).await.unwrap();
        let after = store
            .acquire_run_lease(r.id, "proc-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(after.is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let store = MemoryStore::new();
        let r = run();
        store.insert_run(&r).await.unwrap();

        store
            .acquire_run_lease(r.id, "proc-a", Duration::ZERO)
            .await
            .unwrap()
            .expect("acquire");
        let second = store
            .acquire_run_lease(r.id, "proc-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_some(), "expired lease must not block takeover");
    }

    #[tokio::test]
    async fn update_under_live_lease_requires_token() {
        let store = MemoryStore::new();
        let mut r = run();
        store.insert_run(&r).await.unwrap();

        let token = store
            .acquire_run_lease(r.id, "proc-a", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("acquire");

        let stored = store.get_run(r.id).await.unwrap().unwrap();
        r.state = crate::model::RunState::Validating;

        let err = store
            .update_run(&r, stored.state_version, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LeaseViolation(_)));

        store
            .update_run(&r, stored.state_version, Some(&token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_progress_reconciles_counters_idempotently() {
        let store = MemoryStore::new();
        let r = run();
        store.insert_run(&r).await.unwrap();

        let mut completed = Subtask::new(
            r.id,
            0,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        );
        completed.state = SubtaskState::Completed;
        let mut retryable = Subtask::new(
            r.id,
            1,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        );
        retryable.state = SubtaskState::Failed;
        retryable.attempt_count = 1;
        let mut exhausted = Subtask::new(
            r.id,
            2,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        );
        exhausted.state = SubtaskState::Failed;
        exhausted.attempt_count = 3;
        store
            .insert_subtasks(&[completed, retryable, exhausted])
            .await
            .unwrap();

        let first = store.sync_progress(r.id).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.completed, 1);
        assert_eq!(first.failed, 1, "retryable failure must not count");

        // Duplicate event deliveries re-run the sync without drift.
        let second = store.sync_progress(r.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stalled_scan_includes_never_heartbeated_assignments() {
        let store = MemoryStore::new();
        let r = run();
        store.insert_run(&r).await.unwrap();

        let mut subtask = Subtask::new(
            r.id,
            0,
            SubtaskKind::Research,
            json!({}),
            3,
            BTreeSet::new(),
        );
        subtask.state = SubtaskState::Assigned;
        store.insert_subtasks(&[subtask]).await.unwrap();

        let stalled = store.stalled_subtasks(Utc::now(), 10).await.unwrap();
        assert_eq!(stalled.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_window_counts_only_inside_window() {
        let store = MemoryStore::new();
        store.record_dispatch(&"acme".into()).await.unwrap();
        store.record_dispatch(&"acme".into()).await.unwrap();
        store.record_dispatch(&"globex".into()).await.unwrap();

        let window = store
            .dispatch_window(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(window.total, 3);
        assert_eq!(window.for_tenant(&"acme".into()), 2);
        assert_eq!(window.tenant_count(), 2);

        let empty = store
            .dispatch_window(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(empty.total, 0);
    }
}
