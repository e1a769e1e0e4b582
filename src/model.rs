//! Core data model: runs, subtasks, and their validated state machines.
//!
//! The transition tables in this module are the single source of truth for
//! lifecycle movement. Any write that is not present in the table fails with
//! `InvalidTransition` before touching persisted state.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

// ============================================================================
// Typed identifiers
// ============================================================================

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subtask is addressed by its parent run and a dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskId {
    pub run_id: RunId,
    pub index: u32,
}

impl SubtaskId {
    pub fn new(run_id: RunId, index: u32) -> Self {
        Self { run_id, index }
    }
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.index)
    }
}

/// Owning tenant of a run; fairness accounting is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fencing token returned by a successful run-lease acquisition. Every
/// state-machine mutation made under the lease must present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token handed to a worker when it claims a subtask; must accompany
/// heartbeats and outcome reports for that assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionToken(pub Uuid);

impl ExecutionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Run state machine
// ============================================================================

/// Lifecycle phases of a run, in strict order. Any non-terminal state may
/// fall into `Failed` or `Cancelled`; there are no other backward edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Validating,
    Decomposing,
    Scheduling,
    Executing,
    Aggregating,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Decomposing => "decomposing",
            Self::Scheduling => "scheduling",
            Self::Executing => "executing",
            Self::Aggregating => "aggregating",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> OrchestratorResult<Self> {
        match s {
            "created" => Ok(Self::Created),
            "validating" => Ok(Self::Validating),
            "decomposing" => Ok(Self::Decomposing),
            "scheduling" => Ok(Self::Scheduling),
            "executing" => Ok(Self::Executing),
            "aggregating" => Ok(Self::Aggregating),
            "finalizing" => Ok(Self::Finalizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(OrchestratorError::Store(format!(
                "unknown run state: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The forward edge out of this phase, if any.
    fn next(&self) -> Option<RunState> {
        match self {
            Self::Created => Some(Self::Validating),
            Self::Validating => Some(Self::Decomposing),
            Self::Decomposing => Some(Self::Scheduling),
            Self::Scheduling => Some(Self::Executing),
            Self::Executing => Some(Self::Aggregating),
            Self::Aggregating => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    /// Transition table lookup. Forward one step, or into terminal
    /// failure/cancellation from any non-terminal state.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Self::Failed | Self::Cancelled) {
            return true;
        }
        self.next() == Some(to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Subtask state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    /// Will never become ready: a dependency failed permanently or was
    /// cancelled.
    Skipped,
    Cancelled,
}

impl SubtaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> OrchestratorResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(OrchestratorError::Store(format!(
                "unknown subtask state: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Transition table lookup. `Failed -> Pending` is the retry edge and the
    /// only way out of `Failed`.
    pub fn can_transition_to(&self, to: SubtaskState) -> bool {
        match (self, to) {
            (Self::Pending, Self::Queued) => true,
            (Self::Pending, Self::Skipped) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Queued, Self::Assigned) => true,
            (Self::Queued, Self::Cancelled) => true,
            (Self::Assigned, Self::Running) => true,
            (Self::Assigned, Self::Failed) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Failed, Self::Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Subtask kinds
// ============================================================================

/// Closed set of subtask kinds. The queue mapping is exhaustive so adding a
/// kind is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskKind {
    Research,
    Extraction,
    Analysis,
    Synthesis,
}

impl SubtaskKind {
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::Research => "subtasks.research",
            Self::Extraction => "subtasks.extraction",
            Self::Analysis => "subtasks.analysis",
            Self::Synthesis => "subtasks.synthesis",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Extraction => "extraction",
            Self::Analysis => "analysis",
            Self::Synthesis => "synthesis",
        }
    }

    pub fn parse(s: &str) -> OrchestratorResult<Self> {
        match s {
            "research" => Ok(Self::Research),
            "extraction" => Ok(Self::Extraction),
            "analysis" => Ok(Self::Analysis),
            "synthesis" => Ok(Self::Synthesis),
            other => Err(OrchestratorError::Store(format!(
                "unknown subtask kind: {other}"
            ))),
        }
    }
}

// ============================================================================
// Run
// ============================================================================

/// Per-run execution limits supplied at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub max_subtasks: u32,
    pub max_attempts: u32,
    pub timeout_seconds: i64,
    /// Caller priority, 1 (lowest) to 10 (highest).
    pub priority: u8,
    pub budget_ceiling: Option<f64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_subtasks: 20,
            max_attempts: 3,
            timeout_seconds: 30 * 60,
            priority: 5,
            budget_ceiling: None,
        }
    }
}

/// Progress counters over a run's subtasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub cancelled: u32,
}

impl RunProgress {
    pub fn terminal(&self) -> u32 {
        self.completed + self.failed + self.skipped + self.cancelled
    }

    /// `completed+failed+skipped+cancelled <= total` must hold at all times.
    pub fn is_consistent(&self) -> bool {
        self.terminal() <= self.total
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.terminal() as f64 / self.total as f64) * 100.0
    }
}

/// A time-bounded exclusive claim on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub token: LeaseToken,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub summary: Value,
    pub artifacts: Vec<String>,
}

/// One top-level research/work request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tenant: TenantId,
    pub query: Value,
    pub settings: RunSettings,
    pub state: RunState,
    /// Optimistic concurrency token; strictly increases on every persisted
    /// mutation.
    pub state_version: i64,
    pub lease: Option<RunLease>,
    pub progress: RunProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl Run {
    pub fn new(tenant: TenantId, query: Value, settings: RunSettings) -> Self {
        Self {
            id: RunId::new(),
            tenant,
            query,
            settings,
            state: RunState::Created,
            state_version: 0,
            lease: None,
            progress: RunProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deadline_at: None,
            outcome: None,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.map(|d| now >= d).unwrap_or(false)
    }

    /// Fraction of subtasks that permanently failed, in [0, 1].
    pub fn failed_fraction(&self) -> f64 {
        if self.progress.total == 0 {
            return 0.0;
        }
        self.progress.failed as f64 / self.progress.total as f64
    }

    /// Stable digest of the query payload, used for validation-phase
    /// de-duplication of recently-identical requests.
    pub fn query_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant.0.as_bytes());
        hasher.update(b":");
        hasher.update(self.query.to_string().as_bytes());
        hex_digest(hasher)
    }
}

// ============================================================================
// Subtask
// ============================================================================

/// Ordered record of one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Resumable progress persisted by a worker before reporting an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u32,
    pub state: Value,
    /// Worker that produced the checkpoint; used as a best-effort affinity
    /// hint on re-dispatch.
    pub worker: Option<WorkerId>,
}

/// One unit of work belonging to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub run_id: RunId,
    pub index: u32,
    pub kind: SubtaskKind,
    pub input: Value,
    pub state: SubtaskState,
    pub state_version: i64,
    /// Number of attempts that have ended in failure so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub execution_token: Option<ExecutionToken>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<Checkpoint>,
    pub result: Option<Value>,
    pub errors: Vec<ErrorRecord>,
    /// Indices of subtasks in the same run that must complete first.
    pub depends_on: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(
        run_id: RunId,
        index: u32,
        kind: SubtaskKind,
        input: Value,
        max_attempts: u32,
        depends_on: BTreeSet<u32>,
    ) -> Self {
        Self {
            run_id,
            index,
            kind,
            input,
            state: SubtaskState::Pending,
            state_version: 0,
            attempt_count: 0,
            max_attempts,
            assigned_worker: None,
            execution_token: None,
            last_heartbeat_at: None,
            checkpoint: None,
            result: None,
            errors: Vec::new(),
            depends_on,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> SubtaskId {
        SubtaskId::new(self.run_id, self.index)
    }

    /// Globally unique dedup key derived from `(run_id, index)`. Redundant
    /// enqueue attempts for the same subtask collapse to one queue entry.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.run_id.0.as_bytes());
        hasher.update(b":");
        hasher.update(self.index.to_be_bytes());
        hex_digest(hasher)
    }

    /// A subtask is ready iff every dependency index is in the completed set.
    pub fn is_ready(&self, completed: &BTreeSet<u32>) -> bool {
        self.state == SubtaskState::Pending
            && self.depends_on.iter().all(|dep| completed.contains(dep))
    }

    pub fn retries_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// True when this subtask will never run again: completed, skipped,
    /// cancelled, or failed with no retries left. A `Failed` subtask still
    /// inside its retry budget is *not* settled; the failure handler will
    /// reset it to `Pending`.
    pub fn is_settled(&self) -> bool {
        match self.state {
            SubtaskState::Completed | SubtaskState::Skipped | SubtaskState::Cancelled => true,
            SubtaskState::Failed => !self.retries_remaining(),
            _ => false,
        }
    }

    pub fn record_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            code: code.into(),
            message: message.into(),
            attempt: self.attempt_count,
            at: Utc::now(),
        });
    }
}

// ============================================================================
// Transition audit
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionEntity {
    Run(RunId),
    Subtask(SubtaskId),
}

impl fmt::Display for TransitionEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "run:{id}"),
            Self::Subtask(id) => write!(f, "subtask:{id}"),
        }
    }
}

/// Immutable audit row appended on every state transition, for both runs and
/// subtasks. Survives even when a later transition is found invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub entity: TransitionEntity,
    pub from_state: String,
    pub to_state: String,
    pub version: i64,
    pub trigger: String,
    pub at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn for_run(run: &Run, from: RunState, to: RunState, trigger: &str) -> Self {
        Self {
            entity: TransitionEntity::Run(run.id),
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            version: run.state_version,
            trigger: trigger.to_string(),
            at: Utc::now(),
        }
    }

    pub fn for_subtask(
        subtask: &Subtask,
        from: SubtaskState,
        to: SubtaskState,
        trigger: &str,
    ) -> Self {
        Self {
            entity: TransitionEntity::Subtask(subtask.id()),
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            version: subtask.state_version,
            trigger: trigger.to_string(),
            at: Utc::now(),
        }
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RUN_STATES: [RunState; 10] = [
        RunState::Created,
        RunState::Validating,
        RunState::Decomposing,
        RunState::Scheduling,
        RunState::Executing,
        RunState::Aggregating,
        RunState::Finalizing,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelled,
    ];

    const ALL_SUBTASK_STATES: [SubtaskState; 8] = [
        SubtaskState::Pending,
        SubtaskState::Queued,
        SubtaskState::Assigned,
        SubtaskState::Running,
        SubtaskState::Completed,
        SubtaskState::Failed,
        SubtaskState::Skipped,
        SubtaskState::Cancelled,
    ];

    #[test]
    fn run_states_advance_in_strict_order() {
        let order = [
            RunState::Created,
            RunState::Validating,
            RunState::Decomposing,
            RunState::Scheduling,
            RunState::Executing,
            RunState::Aggregating,
            RunState::Finalizing,
            RunState::Completed,
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn run_states_cannot_skip_forward_or_move_backward() {
        assert!(!RunState::Created.can_transition_to(RunState::Decomposing));
        assert!(!RunState::Validating.can_transition_to(RunState::Executing));
        assert!(!RunState::Executing.can_transition_to(RunState::Finalizing));
        assert!(!RunState::Executing.can_transition_to(RunState::Scheduling));
        assert!(!RunState::Aggregating.can_transition_to(RunState::Executing));
    }

    #[test]
    fn any_non_terminal_run_state_can_fail_or_cancel() {
        for state in ALL_RUN_STATES {
            if state.is_terminal() {
                assert!(!state.can_transition_to(RunState::Failed));
                assert!(!state.can_transition_to(RunState::Cancelled));
            } else {
                assert!(state.can_transition_to(RunState::Failed));
                assert!(state.can_transition_to(RunState::Cancelled));
            }
        }
    }

    #[test]
    fn terminal_run_states_have_no_outgoing_edges() {
        for from in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            for to in ALL_RUN_STATES {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn failed_to_pending_is_the_only_edge_out_of_failed() {
        for to in ALL_SUBTASK_STATES {
            let allowed = SubtaskState::Failed.can_transition_to(to);
            assert_eq!(allowed, to == SubtaskState::Pending);
        }
    }

    #[test]
    fn subtask_happy_path_is_allowed() {
        let path = [
            SubtaskState::Pending,
            SubtaskState::Queued,
            SubtaskState::Assigned,
            SubtaskState::Running,
            SubtaskState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn only_pending_and_queued_subtasks_can_be_cancelled() {
        for from in ALL_SUBTASK_STATES {
            let allowed = from.can_transition_to(SubtaskState::Cancelled);
            let expected = matches!(from, SubtaskState::Pending | SubtaskState::Queued);
            assert_eq!(allowed, expected, "{from} -> cancelled");
        }
    }

    #[test]
    fn subtask_cannot_run_without_assignment() {
        assert!(!SubtaskState::Pending.can_transition_to(SubtaskState::Running));
        assert!(!SubtaskState::Queued.can_transition_to(SubtaskState::Running));
    }

    #[test]
    fn only_pending_subtasks_can_be_skipped() {
        for from in ALL_SUBTASK_STATES {
            let allowed = from.can_transition_to(SubtaskState::Skipped);
            assert_eq!(allowed, from == SubtaskState::Pending, "{from} -> skipped");
        }
        for to in ALL_SUBTASK_STATES {
            assert!(!SubtaskState::Skipped.can_transition_to(to));
        }
    }

    #[test]
    fn failed_subtask_is_settled_only_when_retries_are_exhausted() {
        let mut subtask = Subtask::new(
            RunId::new(),
            0,
            SubtaskKind::Research,
            Value::Null,
            3,
            BTreeSet::new(),
        );
        subtask.state = SubtaskState::Failed;
        subtask.attempt_count = 1;
        assert!(!subtask.is_settled());

        subtask.attempt_count = 3;
        assert!(subtask.is_settled());
    }

    #[test]
    fn idempotency_key_is_stable_and_distinct() {
        let run_id = RunId::new();
        let a = Subtask::new(
            run_id,
            0,
            SubtaskKind::Research,
            Value::Null,
            3,
            BTreeSet::new(),
        );
        let b = Subtask::new(
            run_id,
            1,
            SubtaskKind::Research,
            Value::Null,
            3,
            BTreeSet::new(),
        );
        assert_eq!(a.idempotency_key(), a.idempotency_key());
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn readiness_requires_all_dependencies_completed() {
        let run_id = RunId::new();
        let subtask = Subtask::new(
            run_id,
            3,
            SubtaskKind::Synthesis,
            Value::Null,
            3,
            BTreeSet::from([0, 1, 2]),
        );
        let mut completed = BTreeSet::from([0, 1]);
        assert!(!subtask.is_ready(&completed));
        completed.insert(2);
        assert!(subtask.is_ready(&completed));
    }

    #[test]
    fn progress_invariant_holds() {
        let progress = RunProgress {
            total: 5,
            completed: 3,
            failed: 1,
            skipped: 0,
            cancelled: 1,
        };
        assert!(progress.is_consistent());
        assert_eq!(progress.terminal(), 5);

        let overflow = RunProgress {
            total: 2,
            completed: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(!overflow.is_consistent());
    }

    #[test]
    fn query_digest_distinguishes_tenants() {
        let query = serde_json::json!({"q": "compare markets"});
        let a = Run::new("acme".into(), query.clone(), RunSettings::default());
        let b = Run::new("globex".into(), query, RunSettings::default());
        assert_ne!(a.query_digest(), b.query_digest());
    }

    #[test]
    fn queue_mapping_is_exhaustive() {
        for kind in [
            SubtaskKind::Research,
            SubtaskKind::Extraction,
            SubtaskKind::Analysis,
            SubtaskKind::Synthesis,
        ] {
            assert!(kind.queue_name().starts_with("subtasks."));
            assert_eq!(SubtaskKind::parse(kind.as_str()).unwrap(), kind);
        }
    }
}
