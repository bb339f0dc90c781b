use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::EdgeCondition;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Completed,
    Escalated,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Active)
    }
}

// ---------------------------------------------------------------------------
// TransitionRecord
// ---------------------------------------------------------------------------

/// One entry in an execution's ordered history: the node arrived at (or
/// retried), who drove the transition, and on what condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub node_key: String,
    pub actor: String,
    pub condition: EdgeCondition,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// Per-bead live workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub bead_id: Uuid,
    pub current_node: String,
    pub status: ExecutionStatus,
    /// Times the execution has returned to the entry node.
    pub cycle_count: u32,
    /// Retries on the current node; resets to 1 on every move.
    pub node_attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_node_at: DateTime<Utc>,
    pub history: Vec<TransitionRecord>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: Uuid, bead_id: Uuid, entry_node: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            bead_id,
            current_node: entry_node.into(),
            status: ExecutionStatus::Active,
            cycle_count: 0,
            node_attempt_count: 1,
            started_at: now,
            last_node_at: now,
            history: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_starts_active_at_entry() {
        let exec = WorkflowExecution::new(Uuid::new_v4(), Uuid::new_v4(), "investigate");
        assert_eq!(exec.status, ExecutionStatus::Active);
        assert_eq!(exec.current_node, "investigate");
        assert_eq!(exec.cycle_count, 0);
        assert_eq!(exec.node_attempt_count, 1);
        assert!(exec.history.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Active.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Escalated.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }
}
