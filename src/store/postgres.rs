//! Postgres-backed store.
//!
//! Conditional updates are plain `UPDATE ... WHERE state_version = $n`;
//! leases are conditional writes guarded by `lease_expires_at <= NOW()`.
//! Nested structures (settings, checkpoint, error history, dependency sets)
//! are JSONB columns.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    ExecutionToken, LeaseToken, Run, RunId, RunLease, RunOutcome, RunProgress, RunState, Subtask,
    SubtaskId, SubtaskKind, SubtaskState, TenantId, TransitionEntity, TransitionRecord, WorkerId,
};

use super::{DispatchWindow, Store};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> OrchestratorResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id UUID PRIMARY KEY,
                tenant TEXT NOT NULL,
                query JSONB NOT NULL,
                query_digest TEXT NOT NULL,
                settings JSONB NOT NULL,
                state TEXT NOT NULL,
                state_version BIGINT NOT NULL DEFAULT 0,
                lease_token UUID,
                lease_holder TEXT,
                lease_expires_at TIMESTAMPTZ,
                total_subtasks INTEGER NOT NULL DEFAULT 0,
                completed_subtasks INTEGER NOT NULL DEFAULT 0,
                failed_subtasks INTEGER NOT NULL DEFAULT 0,
                skipped_subtasks INTEGER NOT NULL DEFAULT 0,
                cancelled_subtasks INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                deadline_at TIMESTAMPTZ,
                outcome JSONB
            );

            CREATE INDEX IF NOT EXISTS idx_runs_deadline
                ON runs(deadline_at)
                WHERE state = 'executing';

            CREATE INDEX IF NOT EXISTS idx_runs_digest
                ON runs(query_digest, created_at);

            CREATE TABLE IF NOT EXISTS subtasks (
                run_id UUID NOT NULL,
                subtask_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                input JSONB NOT NULL,
                state TEXT NOT NULL,
                state_version BIGINT NOT NULL DEFAULT 0,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                assigned_worker TEXT,
                execution_token UUID,
                last_heartbeat_at TIMESTAMPTZ,
                checkpoint JSONB,
                result JSONB,
                errors JSONB NOT NULL DEFAULT '[]',
                depends_on JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (run_id, subtask_index)
            );

            CREATE INDEX IF NOT EXISTS idx_subtasks_stalled
                ON subtasks(last_heartbeat_at)
                WHERE state IN ('assigned', 'running');

            CREATE TABLE IF NOT EXISTS transitions (
                id BIGSERIAL PRIMARY KEY,
                run_id UUID NOT NULL,
                subtask_index INTEGER,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                version BIGINT NOT NULL,
                trigger TEXT NOT NULL,
                at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_run
                ON transitions(run_id, id);

            CREATE TABLE IF NOT EXISTS dispatch_history (
                id BIGSERIAL PRIMARY KEY,
                tenant TEXT NOT NULL,
                dispatched_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_dispatch_history_at
                ON dispatch_history(dispatched_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Distinguish a lost version race from a lease violation or a missing
    /// row after a conditional update touched nothing.
    async fn diagnose_run_update(
        &self,
        id: RunId,
        expected_version: i64,
    ) -> OrchestratorError {
        let row = match sqlx::query(
            "SELECT state_version, lease_token, lease_expires_at FROM runs WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(row)) => row,
            Ok(None) => return OrchestratorError::NotFound(format!("run {id}")),
            Err(err) => return err.into(),
        };
        let version: i64 = row.get("state_version");
        if version != expected_version {
            return OrchestratorError::Concurrency(format!("run {id}"));
        }
        OrchestratorError::LeaseViolation(id.to_string())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_run(&self, run: &Run) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, tenant, query, query_digest, settings, state, state_version,
                total_subtasks, completed_subtasks, failed_subtasks,
                skipped_subtasks, cancelled_subtasks,
                created_at, started_at, completed_at, deadline_at, outcome
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(run.id.0)
        .bind(&run.tenant.0)
        .bind(&run.query)
        .bind(run.query_digest())
        .bind(serde_json::to_value(&run.settings)?)
        .bind(run.state.as_str())
        .bind(run.state_version)
        .bind(run.progress.total as i32)
        .bind(run.progress.completed as i32)
        .bind(run.progress.failed as i32)
        .bind(run.progress.skipped as i32)
        .bind(run.progress.cancelled as i32)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.deadline_at)
        .bind(
            run.outcome
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> OrchestratorResult<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| run_from_row(&row)).transpose()
    }

    async fn update_run(
        &self,
        run: &Run,
        expected_version: i64,
        lease: Option<&LeaseToken>,
    ) -> OrchestratorResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                settings = $3,
                state = $4,
                state_version = state_version + 1,
                total_subtasks = $5,
                completed_subtasks = $6,
                failed_subtasks = $7,
                skipped_subtasks = $8,
                cancelled_subtasks = $9,
                started_at = $10,
                completed_at = $11,
                deadline_at = $12,
                outcome = $13
            WHERE id = $1
              AND state_version = $2
              AND (lease_token IS NULL OR lease_expires_at <= NOW() OR lease_token = $14)
            "#,
        )
        .bind(run.id.0)
        .bind(expected_version)
        .bind(serde_json::to_value(&run.settings)?)
        .bind(run.state.as_str())
        .bind(run.progress.total as i32)
        .bind(run.progress.completed as i32)
        .bind(run.progress.failed as i32)
        .bind(run.progress.skipped as i32)
        .bind(run.progress.cancelled as i32)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.deadline_at)
        .bind(
            run.outcome
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(lease.map(|token| token.0))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_run_update(run.id, expected_version).await);
        }
        Ok(expected_version + 1)
    }

    async fn acquire_run_lease(
        &self,
        id: RunId,
        holder: &str,
        ttl: Duration,
    ) -> OrchestratorResult<Option<LeaseToken>> {
        let token = LeaseToken::new();
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                lease_token = $2,
                lease_holder = $3,
                lease_expires_at = NOW() + ($4 || ' seconds')::interval,
                state_version = state_version + 1
            WHERE id = $1
              AND (lease_token IS NULL OR lease_expires_at <= NOW())
            "#,
        )
        .bind(id.0)
        .bind(token.0)
        .bind(holder)
        .bind(ttl.as_secs().to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(token))
    }

    async fn release_run_lease(&self, id: RunId, token: LeaseToken) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE runs SET
                lease_token = NULL,
                lease_holder = NULL,
                lease_expires_at = NULL,
                state_version = state_version + 1
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(id.0)
        .bind(token.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_progress(&self, id: RunId) -> OrchestratorResult<RunProgress> {
        let row = sqlx::query(
            r#"
            UPDATE runs SET
                total_subtasks = counts.total,
                completed_subtasks = counts.completed,
                failed_subtasks = counts.failed,
                skipped_subtasks = counts.skipped,
                cancelled_subtasks = counts.cancelled,
                state_version = state_version + 1
            FROM (
                SELECT
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                    COUNT(*) FILTER (
                        WHERE state = 'failed' AND attempt_count >= max_attempts
                    ) AS failed,
                    COUNT(*) FILTER (WHERE state = 'skipped') AS skipped,
                    COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled
                FROM subtasks WHERE run_id = $1
            ) AS counts
            WHERE id = $1
            RETURNING total_subtasks, completed_subtasks, failed_subtasks,
                      skipped_subtasks, cancelled_subtasks
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("run {id}")))?;
        Ok(progress_from_row(&row))
    }

    async fn insert_subtasks(&self, subtasks: &[Subtask]) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        for subtask in subtasks {
            sqlx::query(
                r#"
                INSERT INTO subtasks (
                    run_id, subtask_index, kind, input, state, state_version,
                    attempt_count, max_attempts, assigned_worker, execution_token,
                    last_heartbeat_at, checkpoint, result, errors, depends_on, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(subtask.run_id.0)
            .bind(subtask.index as i32)
            .bind(subtask.kind.as_str())
            .bind(&subtask.input)
            .bind(subtask.state.as_str())
            .bind(subtask.state_version)
            .bind(subtask.attempt_count as i32)
            .bind(subtask.max_attempts as i32)
            .bind(subtask.assigned_worker.as_ref().map(|w| w.0.clone()))
            .bind(subtask.execution_token.map(|t| t.0))
            .bind(subtask.last_heartbeat_at)
            .bind(
                subtask
                    .checkpoint
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            )
            .bind(subtask.result.clone())
            .bind(serde_json::to_value(&subtask.errors)?)
            .bind(serde_json::to_value(&subtask.depends_on)?)
            .bind(subtask.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_subtask(&self, id: SubtaskId) -> OrchestratorResult<Option<Subtask>> {
        let row = sqlx::query("SELECT * FROM subtasks WHERE run_id = $1 AND subtask_index = $2")
            .bind(id.run_id.0)
            .bind(id.index as i32)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| subtask_from_row(&row)).transpose()
    }

    async fn list_subtasks(&self, run_id: RunId) -> OrchestratorResult<Vec<Subtask>> {
        let rows =
            sqlx::query("SELECT * FROM subtasks WHERE run_id = $1 ORDER BY subtask_index")
                .bind(run_id.0)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(subtask_from_row).collect()
    }

    async fn update_subtask(
        &self,
        subtask: &Subtask,
        expected_version: i64,
    ) -> OrchestratorResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE subtasks SET
                state = $4,
                state_version = state_version + 1,
                attempt_count = $5,
                assigned_worker = $6,
                execution_token = $7,
                last_heartbeat_at = $8,
                checkpoint = $9,
                result = $10,
                errors = $11
            WHERE run_id = $1 AND subtask_index = $2 AND state_version = $3
            "#,
        )
        .bind(subtask.run_id.0)
        .bind(subtask.index as i32)
        .bind(expected_version)
        .bind(subtask.state.as_str())
        .bind(subtask.attempt_count as i32)
        .bind(subtask.assigned_worker.as_ref().map(|w| w.0.clone()))
        .bind(subtask.execution_token.map(|t| t.0))
        .bind(subtask.last_heartbeat_at)
        .bind(
            subtask
                .checkpoint
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(subtask.result.clone())
        .bind(serde_json::to_value(&subtask.errors)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists =
                sqlx::query("SELECT 1 FROM subtasks WHERE run_id = $1 AND subtask_index = $2")
                    .bind(subtask.run_id.0)
                    .bind(subtask.index as i32)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => OrchestratorError::Concurrency(format!("subtask {}", subtask.id())),
                None => OrchestratorError::NotFound(format!("subtask {}", subtask.id())),
            });
        }
        Ok(expected_version + 1)
    }

    async fn executing_runs_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<RunId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM runs
            WHERE state = 'executing' AND deadline_at IS NOT NULL AND deadline_at <= $1
            ORDER BY deadline_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| RunId(row.get::<Uuid, _>("id")))
            .collect())
    }

    async fn stalled_subtasks(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<Subtask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM subtasks
            WHERE state IN ('assigned', 'running')
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            ORDER BY last_heartbeat_at NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(heartbeat_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subtask_from_row).collect()
    }

    async fn active_runs(&self, limit: i64) -> OrchestratorResult<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE state NOT IN ('completed', 'failed', 'cancelled')
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn record_dispatch(&self, tenant: &TenantId) -> OrchestratorResult<()> {
        sqlx::query("INSERT INTO dispatch_history (tenant) VALUES ($1)")
            .bind(&tenant.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dispatch_window(&self, since: DateTime<Utc>) -> OrchestratorResult<DispatchWindow> {
        // Rows older than the window are dead weight; drop them on read.
        sqlx::query("DELETE FROM dispatch_history WHERE dispatched_at < $1")
            .bind(since)
            .execute(&self.pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT tenant, COUNT(*) AS dispatches
            FROM dispatch_history
            WHERE dispatched_at >= $1
            GROUP BY tenant
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut per_tenant = HashMap::new();
        let mut total = 0u64;
        for row in rows {
            let tenant: String = row.get("tenant");
            let count: i64 = row.get("dispatches");
            total += count as u64;
            per_tenant.insert(TenantId(tenant), count as u64);
        }
        Ok(DispatchWindow { per_tenant, total })
    }

    async fn append_transition(&self, record: &TransitionRecord) -> OrchestratorResult<()> {
        let (run_id, subtask_index) = match &record.entity {
            TransitionEntity::Run(id) => (id.0, None),
            TransitionEntity::Subtask(id) => (id.run_id.0, Some(id.index as i32)),
        };
        sqlx::query(
            r#"
            INSERT INTO transitions (run_id, subtask_index, from_state, to_state, version, trigger, at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(subtask_index)
        .bind(&record.from_state)
        .bind(&record.to_state)
        .bind(record.version)
        .bind(&record.trigger)
        .bind(record.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transitions_for_run(
        &self,
        run_id: RunId,
    ) -> OrchestratorResult<Vec<TransitionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, subtask_index, from_state, to_state, version, trigger, at
            FROM transitions
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let run_id = RunId(row.get::<Uuid, _>("run_id"));
                let entity = match row.get::<Option<i32>, _>("subtask_index") {
                    Some(index) => {
                        TransitionEntity::Subtask(SubtaskId::new(run_id, index as u32))
                    }
                    None => TransitionEntity::Run(run_id),
                };
                TransitionRecord {
                    entity,
                    from_state: row.get("from_state"),
                    to_state: row.get("to_state"),
                    version: row.get("version"),
                    trigger: row.get("trigger"),
                    at: row.get("at"),
                }
            })
            .collect())
    }

    async fn find_recent_run_by_digest(
        &self,
        digest: &str,
        since: DateTime<Utc>,
        exclude: RunId,
    ) -> OrchestratorResult<Option<RunId>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM runs
            WHERE query_digest = $1 AND created_at >= $2 AND id <> $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(digest)
        .bind(since)
        .bind(exclude.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| RunId(row.get::<Uuid, _>("id"))))
    }
}

fn progress_from_row(row: &PgRow) -> RunProgress {
    RunProgress {
        total: row.get::<i32, _>("total_subtasks") as u32,
        completed: row.get::<i32, _>("completed_subtasks") as u32,
        failed: row.get::<i32, _>("failed_subtasks") as u32,
        skipped: row.get::<i32, _>("skipped_subtasks") as u32,
        cancelled: row.get::<i32, _>("cancelled_subtasks") as u32,
    }
}

fn run_from_row(row: &PgRow) -> OrchestratorResult<Run> {
    let lease_token: Option<Uuid> = row.get("lease_token");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    let lease = match (lease_token, lease_expires_at) {
        (Some(token), Some(expires_at)) => Some(RunLease {
            token: LeaseToken(token),
            holder: row.get::<Option<String>, _>("lease_holder").unwrap_or_default(),
            expires_at,
        }),
        _ => None,
    };

    let state: String = row.get("state");
    let outcome: Option<Value> = row.get("outcome");
    Ok(Run {
        id: RunId(row.get::<Uuid, _>("id")),
        tenant: TenantId(row.get("tenant")),
        query: row.get("query"),
        settings: serde_json::from_value(row.get::<Value, _>("settings"))?,
        state: RunState::parse(&state)?,
        state_version: row.get("state_version"),
        lease,
        progress: progress_from_row(row),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        deadline_at: row.get("deadline_at"),
        outcome: outcome
            .map(serde_json::from_value::<RunOutcome>)
            .transpose()?,
    })
}

fn subtask_from_row(row: &PgRow) -> OrchestratorResult<Subtask> {
    let state: String = row.get("state");
    let kind: String = row.get("kind");
    let checkpoint: Option<Value> = row.get("checkpoint");
    Ok(Subtask {
        run_id: RunId(row.get::<Uuid, _>("run_id")),
        index: row.get::<i32, _>("subtask_index") as u32,
        kind: SubtaskKind::parse(&kind)?,
        input: row.get("input"),
        state: SubtaskState::parse(&state)?,
        state_version: row.get("state_version"),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        assigned_worker: row
            .get::<Option<String>, _>("assigned_worker")
            .map(WorkerId),
        execution_token: row
            .get::<Option<Uuid>, _>("execution_token")
            .map(ExecutionToken),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        checkpoint: checkpoint.map(serde_json::from_value).transpose()?,
        result: row.get("result"),
        errors: serde_json::from_value(row.get::<Value, _>("errors"))?,
        depends_on: serde_json::from_value(row.get::<Value, _>("depends_on"))?,
        created_at: row.get("created_at"),
    })
}
