//! Planner contract: the external service that turns a query into subtask
//! definitions plus their dependency edges.
//!
//! The orchestrator never reasons about queries itself; it validates the
//! shape of whatever the planner returns and persists it. Decomposition must
//! be deterministic enough that re-invoking with a stricter cap is safe.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::SubtaskKind;

/// One subtask definition produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub kind: SubtaskKind,
    pub input: Value,
    /// Planner-suggested priority hint; the scheduler's formula may ignore it.
    pub priority: Option<u8>,
    /// Indices into the same plan that must complete first.
    pub depends_on: BTreeSet<u32>,
}

/// Full decomposition of a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub subtasks: Vec<PlannedSubtask>,
    pub reasoning: Option<String>,
}

impl DecompositionPlan {
    /// Dependency graph as explicit (dependent, dependency) index pairs.
    pub fn dependency_edges(&self) -> Vec<(u32, u32)> {
        let mut edges = Vec::new();
        for (index, subtask) in self.subtasks.iter().enumerate() {
            for dep in &subtask.depends_on {
                edges.push((index as u32, *dep));
            }
        }
        edges
    }

    /// Reject plans with out-of-range or self dependencies, or cycles.
    /// Truncating a plan would silently drop edges, so a bad plan is rejected
    /// outright instead of repaired.
    pub fn validate(&self) -> OrchestratorResult<()> {
        let n = self.subtasks.len() as u32;
        for (index, subtask) in self.subtasks.iter().enumerate() {
            let index = index as u32;
            for dep in &subtask.depends_on {
                if *dep >= n {
                    return Err(OrchestratorError::Decomposition(format!(
                        "subtask {index} depends on out-of-range index {dep}"
                    )));
                }
                if *dep == index {
                    return Err(OrchestratorError::Decomposition(format!(
                        "subtask {index} depends on itself"
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> OrchestratorResult<()> {
        // Kahn's algorithm over the dependency edges.
        let n = self.subtasks.len();
        let mut in_degree = vec![0usize; n];
        for (index, subtask) in self.subtasks.iter().enumerate() {
            in_degree[index] = subtask.depends_on.len();
        }
        let mut queue: Vec<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
        let mut visited = 0usize;
        while let Some(done) = queue.pop() {
            visited += 1;
            for (index, subtask) in self.subtasks.iter().enumerate() {
                if subtask.depends_on.contains(&(done as u32)) {
                    in_degree[index] -= 1;
                    if in_degree[index] == 0 {
                        queue.push(index);
                    }
                }
            }
        }
        if visited != n {
            return Err(OrchestratorError::Decomposition(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }
}

/// Query validation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decomposition request: the query and its resource budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeRequest {
    pub query: Value,
    pub max_subtasks: u32,
    pub budget_ceiling: Option<f64>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn validate(&self, query: &Value) -> OrchestratorResult<ValidationOutcome>;

    async fn decompose(&self, request: &DecomposeRequest) -> OrchestratorResult<DecompositionPlan>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planned(depends_on: &[u32]) -> PlannedSubtask {
        PlannedSubtask {
            kind: SubtaskKind::Research,
            input: json!({}),
            priority: None,
            depends_on: depends_on.iter().copied().collect(),
        }
    }

    #[test]
    fn validate_accepts_a_diamond() {
        let plan = DecompositionPlan {
            subtasks: vec![planned(&[]), planned(&[0]), planned(&[0]), planned(&[1, 2])],
            reasoning: None,
        };
        assert!(plan.validate().is_ok());
        let mut edges = plan.dependency_edges();
        edges.sort_unstable();
        assert_eq!(edges, vec![(1, 0), (2, 0), (3, 1), (3, 2)]);
    }

    #[test]
    fn validate_rejects_out_of_range_dependency() {
        let plan = DecompositionPlan {
            subtasks: vec![planned(&[5])],
            reasoning: None,
        };
        assert!(matches!(
            plan.validate(),
            Err(OrchestratorError::Decomposition(_))
        ));
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let plan = DecompositionPlan {
            subtasks: vec![planned(&[0])],
            reasoning: None,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_rejects_cycles() {
        let plan = DecompositionPlan {
            subtasks: vec![planned(&[1]), planned(&[0])],
            reasoning: None,
        };
        assert!(plan.validate().is_err());
    }
}
