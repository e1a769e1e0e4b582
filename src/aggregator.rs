//! Folds completed subtask results into one run-level outcome.
//!
//! What the reducer computes semantically belongs to the caller; the
//! aggregator only guarantees it sees exactly the completed subtasks, in
//! index order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::OrchestratorResult;
use crate::model::{Run, RunOutcome, Subtask, SubtaskState};

#[async_trait]
pub trait ResultReducer: Send + Sync {
    async fn reduce(&self, run: &Run, completed: &[Subtask]) -> OrchestratorResult<RunOutcome>;
}

/// Default reducer: collects per-subtask results into one summary document
/// and lifts any `artifact` references out of the individual results.
pub struct CollectReducer;

#[async_trait]
impl ResultReducer for CollectReducer {
    async fn reduce(&self, run: &Run, completed: &[Subtask]) -> OrchestratorResult<RunOutcome> {
        let results: Vec<_> = completed
            .iter()
            .map(|subtask| {
                json!({
                    "index": subtask.index,
                    "kind": subtask.kind.as_str(),
                    "result": subtask.result,
                })
            })
            .collect();
        let artifacts = completed
            .iter()
            .filter_map(|subtask| {
                subtask
                    .result
                    .as_ref()
                    .and_then(|result| result.get("artifact"))
                    .and_then(|artifact| artifact.as_str())
                    .map(str::to_string)
            })
            .collect();
        Ok(RunOutcome {
            summary: json!({
                "query": run.query,
                "completed": completed.len(),
                "results": results,
            }),
            artifacts,
        })
    }
}

pub struct Aggregator {
    reducer: Arc<dyn ResultReducer>,
}

impl Aggregator {
    pub fn new(reducer: Arc<dyn ResultReducer>) -> Self {
        Self { reducer }
    }

    /// Reduce over the completed subset of `subtasks`.
    pub async fn aggregate(
        &self,
        run: &Run,
        subtasks: &[Subtask],
    ) -> OrchestratorResult<RunOutcome> {
        let mut completed: Vec<Subtask> = subtasks
            .iter()
            .filter(|subtask| subtask.state == SubtaskState::Completed)
            .cloned()
            .collect();
        completed.sort_by_key(|subtask| subtask.index);
        self.reducer.reduce(run, &completed).await
    }
}
