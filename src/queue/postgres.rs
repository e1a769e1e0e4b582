//! Postgres-backed job queue.
//!
//! Dedup is a partial-unique constraint on `(queue, dedup_key)`; pulls use
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-deliver an
//! entry from the same poll.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::OrchestratorResult;

use super::{JobQueue, QueuedJob};

pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> OrchestratorResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                queue TEXT NOT NULL,
                job_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                priority SMALLINT NOT NULL,
                deliver_at TIMESTAMPTZ NOT NULL,
                dedup_key TEXT NOT NULL DEFAULT '',
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_dedup
                ON jobs(queue, dedup_key)
                WHERE dedup_key <> '';

            CREATE INDEX IF NOT EXISTS idx_jobs_pull
                ON jobs(queue, deliver_at, priority DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        priority: u8,
        delay: Duration,
        dedup_key: &str,
    ) -> OrchestratorResult<bool> {
        let deliver_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (queue, job_id, payload, priority, deliver_at, dedup_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (queue, dedup_key) WHERE dedup_key <> '' DO NOTHING
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .bind(&payload)
        .bind(priority as i16)
        .bind(deliver_at)
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            metrics::counter!("cairn_enqueue_deduped_total").increment(1);
            return Ok(false);
        }
        Ok(true)
    }

    async fn pull(&self, queue: &str, limit: usize) -> OrchestratorResult<Vec<QueuedJob>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND deliver_at <= NOW()
                ORDER BY priority DESC, deliver_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING queue, job_id, payload, priority, deliver_at, dedup_key, enqueued_at
            "#,
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let priority: i16 = row.get("priority");
            let deliver_at: DateTime<Utc> = row.get("deliver_at");
            let enqueued_at: DateTime<Utc> = row.get("enqueued_at");
            jobs.push(QueuedJob {
                queue: row.get("queue"),
                job_id: row.get("job_id"),
                payload: row.get("payload"),
                priority: priority as u8,
                deliver_at,
                dedup_key: row.get("dedup_key"),
                enqueued_at,
            });
        }
        Ok(jobs)
    }
}
