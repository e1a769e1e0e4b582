//! Internal event bus: progress, completion, and failure notifications.
//!
//! Delivery ordering across unrelated runs is not guaranteed and handlers may
//! see the same event more than once, so every handler must be idempotent.
//! Handlers are side-effect-bounded: they may mutate their own entity and
//! enqueue further idempotent work, nothing else.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::OrchestratorResult;
use crate::model::{RunId, RunProgress, SubtaskId};

/// Closed set of event types handlers can register against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubtaskCompleted,
    SubtaskFailed,
    RunProgress,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubtaskCompleted => "subtask_completed",
            Self::SubtaskFailed => "subtask_failed",
            Self::RunProgress => "run_progress",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub run_id: RunId,
    pub subtask: Option<SubtaskId>,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn subtask_completed(id: SubtaskId) -> Self {
        Self {
            kind: EventKind::SubtaskCompleted,
            run_id: id.run_id,
            subtask: Some(id),
            data: Value::Null,
            at: Utc::now(),
        }
    }

    pub fn subtask_failed(id: SubtaskId, code: &str, message: &str) -> Self {
        Self {
            kind: EventKind::SubtaskFailed,
            run_id: id.run_id,
            subtask: Some(id),
            data: json!({ "code": code, "message": message }),
            at: Utc::now(),
        }
    }

    pub fn run_progress(run_id: RunId, progress: RunProgress) -> Self {
        Self {
            kind: EventKind::RunProgress,
            run_id,
            subtask: None,
            data: json!({
                "total": progress.total,
                "completed": progress.completed,
                "failed": progress.failed,
                "skipped": progress.skipped,
                "cancelled": progress.cancelled,
                "percent": progress.percent_complete(),
            }),
            at: Utc::now(),
        }
    }

    pub fn run_terminal(kind: EventKind, run_id: RunId, detail: Value) -> Self {
        Self {
            kind,
            run_id,
            subtask: None,
            data: detail,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> OrchestratorResult<()>;

    fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>);
}

/// In-process bus: publish invokes every registered handler inline. A handler
/// error is logged and counted but never stops the remaining handlers, since
/// the bus promises at-least-once delivery, not transactional fan-out.
#[derive(Default)]
pub struct InProcessEventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: Event) -> OrchestratorResult<()> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let map = self.handlers.read().expect("handler registry poisoned");
            map.get(&event.kind).cloned().unwrap_or_default()
        };
        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                metrics::counter!("cairn_event_handler_errors_total").increment(1);
                warn!(
                    handler = handler.name(),
                    kind = event.kind.as_str(),
                    run_id = %event.run_id,
                    error = %err,
                    "event handler failed"
                );
            }
        }
        Ok(())
    }

    fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .entry(kind)
            .or_default()
            .push(handler);
    }
}
