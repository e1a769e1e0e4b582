//! In-memory queue for tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::OrchestratorResult;

use super::{JobQueue, QueuedJob};

#[derive(Default)]
struct Inner {
    queues: HashMap<String, Vec<QueuedJob>>,
    dedup: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending entries for a queue, including not-yet-due ones. Test helper.
    pub fn snapshot(&self, queue: &str) -> Vec<QueuedJob> {
        let inner = self.inner.lock().expect("queue poisoned");
        inner.queues.get(queue).cloned().unwrap_or_default()
    }

    pub fn pending_count(&self, queue: &str) -> usize {
        self.snapshot(queue).len()
    }

    /// Remove every entry for a queue regardless of delivery time, releasing
    /// the dedup keys. Test helper standing in for an external consumer.
    pub fn drain(&self, queue: &str) -> Vec<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let drained = inner.queues.remove(queue).unwrap_or_default();
        for job in &drained {
            if !job.dedup_key.is_empty() {
                inner
                    .dedup
                    .remove(&(queue.to_string(), job.dedup_key.clone()));
            }
        }
        drained
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        priority: u8,
        delay: Duration,
        dedup_key: &str,
    ) -> OrchestratorResult<bool> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let dedup_entry = (queue.to_string(), dedup_key.to_string());
        if !dedup_key.is_empty() && inner.dedup.contains(&dedup_entry) {
            metrics::counter!("cairn_enqueue_deduped_total").increment(1);
            return Ok(false);
        }
        let now = Utc::now();
        let job = QueuedJob {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            payload,
            priority,
            deliver_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
            dedup_key: dedup_key.to_string(),
            enqueued_at: now,
        };
        inner.queues.entry(queue.to_string()).or_default().push(job);
        if !dedup_key.is_empty() {
            inner.dedup.insert(dedup_entry);
        }
        Ok(true)
    }

    async fn pull(&self, queue: &str, limit: usize) -> OrchestratorResult<Vec<QueuedJob>> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let now = Utc::now();
        let Some(entries) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, job)| job.deliver_at <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by(|a, b| {
            let ja = &entries[*a];
            let jb = &entries[*b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.deliver_at.cmp(&jb.deliver_at))
        });
        due.truncate(limit);

        // Remove back-to-front so indices stay valid.
        due.sort_unstable_by(|a, b| b.cmp(a));
        let mut pulled: Vec<QueuedJob> = due.into_iter().map(|i| entries.remove(i)).collect();
        pulled.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.deliver_at.cmp(&b.deliver_at))
        });

        for job in &pulled {
            if !job.dedup_key.is_empty() {
                inner
                    .dedup
                    .remove(&(queue.to_string(), job.dedup_key.clone()));
            }
        }
        Ok(pulled)
    }
}
