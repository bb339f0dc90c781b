use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loom_core::types::AgentRole;

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Subject builders for the three streams the core publishes to or consumes.
pub mod subjects {
    /// Tasks for agents of a project: `loom.tasks.<project>`.
    pub fn tasks(project_id: &str) -> String {
        format!("loom.tasks.{project_id}")
    }

    /// Results from agents of a project: `loom.results.<project>`.
    pub fn results(project_id: &str) -> String {
        format!("loom.results.{project_id}")
    }

    /// Informational dispatch ticks: `loom.events.dispatch`.
    pub const EVENTS_DISPATCH: &str = "loom.events.dispatch";
}

// ---------------------------------------------------------------------------
// TaskMessage
// ---------------------------------------------------------------------------

/// Published on `loom.tasks.<project>` when a bead is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub bead_id: Uuid,
    /// Correlates the eventual result with this dispatch.
    pub correlation_id: Uuid,
    pub required_role: AgentRole,
    pub instructions: String,
    /// Snapshot of the bead context at dispatch time.
    pub context_snapshot: BTreeMap<String, String>,
    /// Provider the dispatcher selected for this hop.
    pub provider_hint: Option<String>,
}

// ---------------------------------------------------------------------------
// ResultMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    Failure,
    Approved,
    Rejected,
    ProviderError,
}

/// One recorded agent action, carried in the result's action trace and fed
/// to the loop detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceAction {
    pub action_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Consumed from `loom.results.<project>` when an agent finishes a hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub bead_id: Uuid,
    pub correlation_id: Uuid,
    pub agent_id: Uuid,
    pub outcome: ResultOutcome,
    #[serde(default)]
    pub action_trace: Vec<TraceAction>,
    pub error: Option<String>,
    pub result_data: Option<serde_json::Value>,
    /// Provider that served the hop, for registry metric recording.
    pub provider_id: Option<String>,
    pub latency_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// DispatchEvent
// ---------------------------------------------------------------------------

/// Per-pass summary published on `loom.events.dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub project_id: String,
    pub scanned: usize,
    pub dispatched: usize,
    /// Skip reason -> count for this pass.
    pub skipped: BTreeMap<String, usize>,
    /// Ids of CEO decision beads created during this pass.
    pub escalations: Vec<Uuid>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// BusMessage — envelope carried by the in-process bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum BusMessage {
    Task(TaskMessage),
    Result(ResultMessage),
    Dispatch(DispatchEvent),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
