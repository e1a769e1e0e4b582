//! Durable state contract for runs, subtasks, leases, and audit records.
//!
//! Every mutation is a conditional read-modify-write keyed by
//! `(id, expected_version)`. Run mutations made while a non-expired lease
//! exists must present the lease's fencing token. Progress counters are
//! reconciled server-side from the subtask rows, exempt from the lease: they
//! never touch the state machine, so worker reporting does not contend with
//! the lifecycle.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorResult;
use crate::model::{
    LeaseToken, Run, RunId, RunProgress, Subtask, SubtaskId, TenantId, TransitionRecord,
};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Recent dispatch counts per tenant, queried over a sliding window. The
/// fairness multiplier is a pure function of this snapshot, so it stays
/// correct across any number of orchestrator processes.
#[derive(Debug, Clone, Default)]
pub struct DispatchWindow {
    pub per_tenant: HashMap<TenantId, u64>,
    pub total: u64,
}

impl DispatchWindow {
    pub fn tenant_count(&self) -> usize {
        self.per_tenant.len()
    }

    pub fn for_tenant(&self, tenant: &TenantId) -> u64 {
        self.per_tenant.get(tenant).copied().unwrap_or(0)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    async fn insert_run(&self, run: &Run) -> OrchestratorResult<()>;

    async fn get_run(&self, id: RunId) -> OrchestratorResult<Option<Run>>;

    /// Persist `run` conditioned on `expected_version`; the stored version is
    /// bumped and returned. Fails with `Concurrency` when a concurrent writer
    /// won the race, and `LeaseViolation` when a live lease exists and
    /// `lease` does not match it. Lease columns themselves are never written
    /// by this call.
    async fn update_run(
        &self,
        run: &Run,
        expected_version: i64,
        lease: Option<&LeaseToken>,
    ) -> OrchestratorResult<i64>;

    /// Conditional lease write: succeeds only when no unexpired lease exists.
    /// Returns the fencing token, or `None` when the run is missing or
    /// someone else holds it.
    async fn acquire_run_lease(
        &self,
        id: RunId,
        holder: &str,
        ttl: Duration,
    ) -> OrchestratorResult<Option<LeaseToken>>;

    /// Clears the lease iff `token` still matches; a stale token is a no-op.
    async fn release_run_lease(&self, id: RunId, token: LeaseToken) -> OrchestratorResult<()>;

    /// Recompute the run's progress counters from its subtask rows in one
    /// atomic write. Idempotent and exempt from the run lease, so event
    /// handlers can call it on every (possibly duplicated) delivery. A
    /// `Failed` subtask counts as failed only once its retries are exhausted.
    async fn sync_progress(&self, id: RunId) -> OrchestratorResult<RunProgress>;

    // ------------------------------------------------------------------
    // Subtasks
    // ------------------------------------------------------------------

    /// Bulk-insert a run's subtasks and their dependency edges in one
    /// transaction; all rows land or none do.
    async fn insert_subtasks(&self, subtasks: &[Subtask]) -> OrchestratorResult<()>;

    async fn get_subtask(&self, id: SubtaskId) -> OrchestratorResult<Option<Subtask>>;

    async fn list_subtasks(&self, run_id: RunId) -> OrchestratorResult<Vec<Subtask>>;

    async fn update_subtask(
        &self,
        subtask: &Subtask,
        expected_version: i64,
    ) -> OrchestratorResult<i64>;

    // ------------------------------------------------------------------
    // Monitor range queries
    // ------------------------------------------------------------------

    async fn executing_runs_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<RunId>>;

    /// Assigned/running subtasks whose last heartbeat is older than the
    /// cutoff (or that never heartbeated and were assigned before it).
    async fn stalled_subtasks(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<Subtask>>;

    async fn active_runs(&self, limit: i64) -> OrchestratorResult<Vec<Run>>;

    // ------------------------------------------------------------------
    // Fairness window
    // ------------------------------------------------------------------

    async fn record_dispatch(&self, tenant: &TenantId) -> OrchestratorResult<()>;

    async fn dispatch_window(&self, since: DateTime<Utc>) -> OrchestratorResult<DispatchWindow>;

    // ------------------------------------------------------------------
    // Audit and validation dedup
    // ------------------------------------------------------------------

    async fn append_transition(&self, record: &TransitionRecord) -> OrchestratorResult<()>;

    async fn transitions_for_run(&self, run_id: RunId) -> OrchestratorResult<Vec<TransitionRecord>>;

    /// Most recent other run with the same query digest inside the window.
    async fn find_recent_run_by_digest(
        &self,
        digest: &str,
        since: DateTime<Utc>,
        exclude: RunId,
    ) -> OrchestratorResult<Option<RunId>>;
}
