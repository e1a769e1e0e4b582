//! At-least-once job dispatch with per-job dedup keys, delay, and priority.
//!
//! Consumers must tolerate duplicate delivery of the same `job_id`; dedup
//! keys only collapse enqueue attempts while an entry is still pending.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorResult;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

/// One entry as observed by a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub queue: String,
    pub job_id: String,
    pub payload: Value,
    /// Dispatch priority, 1 (lowest) to 100 (highest).
    pub priority: u8,
    pub deliver_at: DateTime<Utc>,
    pub dedup_key: String,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns `false` when a pending entry already carries `dedup_key`;
    /// redundant scheduling calls collapse to one logical job.
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        priority: u8,
        delay: Duration,
        dedup_key: &str,
    ) -> OrchestratorResult<bool>;

    /// Remove and return up to `limit` due jobs, highest priority first.
    async fn pull(&self, queue: &str, limit: usize) -> OrchestratorResult<Vec<QueuedJob>>;
}
