use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loom_core::context;
use loom_core::types::{AgentRole, Bead, BeadType};

use crate::definition::{DefinitionError, EdgeCondition, WorkflowDefinition, WorkflowNode, WorkflowType};
use crate::execution::{ExecutionStatus, TransitionRecord, WorkflowExecution};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),
    #[error("workflow `{workflow}` has no node `{node}`")]
    NodeNotFound { workflow: String, node: String },
    #[error("no workflow definition matches bead {bead_id} of type {bead_type}")]
    NoWorkflowForBead { bead_id: Uuid, bead_type: BeadType },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// EscalationInfo
// ---------------------------------------------------------------------------

/// Human-readable rendering of a stuck execution, used as the body of the
/// CEO decision bead.
#[derive(Debug, Clone)]
pub struct EscalationInfo {
    pub title: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Per-bead workflow state machines.
///
/// Definitions are small and loaded once; executions live in the engine's
/// table. Advancement of one execution is serialized by a per-execution
/// mutex held across the read-modify-write.
pub struct WorkflowEngine {
    definitions: RwLock<Vec<WorkflowDefinition>>,
    executions: DashMap<Uuid, WorkflowExecution>,
    advance_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    max_cycles: u32,
}

impl WorkflowEngine {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            executions: DashMap::new(),
            advance_locks: DashMap::new(),
            max_cycles,
        }
    }

    /// Register a workflow definition after validating it.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let mut defs = self.definitions.write().expect("definitions lock poisoned");
        debug!(workflow = %definition.name, workflow_type = ?definition.workflow_type, "workflow definition registered");
        defs.push(definition);
        Ok(())
    }

    fn definition(&self, id: Uuid) -> Result<WorkflowDefinition> {
        let defs = self.definitions.read().expect("definitions lock poisoned");
        defs.iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(EngineError::DefinitionNotFound(id))
    }

    /// Pick the definition for a bead: a project-scoped definition of the
    /// matching type wins, then a default of the matching type, then any
    /// default.
    fn definition_for_bead(&self, bead: &Bead) -> Result<WorkflowDefinition> {
        let wanted = match bead.bead_type {
            BeadType::Bug => WorkflowType::Bug,
            _ => WorkflowType::Feature,
        };
        let defs = self.definitions.read().expect("definitions lock poisoned");

        let project_scoped = defs.iter().find(|d| {
            d.workflow_type == wanted && d.project_id.as_deref() == Some(bead.project_id.as_str())
        });
        let typed_default = defs
            .iter()
            .find(|d| d.workflow_type == wanted && d.is_default && d.project_id.is_none());
        let any_default = defs.iter().find(|d| d.is_default);

        project_scoped
            .or(typed_default)
            .or(any_default)
            .cloned()
            .ok_or(EngineError::NoWorkflowForBead {
                bead_id: bead.id,
                bead_type: bead.bead_type,
            })
    }

    // -----------------------------------------------------------------------
    // Attachment
    // -----------------------------------------------------------------------

    /// Idempotently attach a workflow to a bead that lacks one.
    ///
    /// When the bead already points at a live execution this returns it
    /// without touching the bead. Otherwise an execution is created at the
    /// entry node and the workflow pointers are written into bead context.
    pub fn ensure_bead_has_workflow(&self, bead: &mut Bead) -> Result<Uuid> {
        if let Some(existing) = bead
            .context
            .get(context::WORKFLOW_EXEC_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            if self.executions.contains_key(&existing) {
                return Ok(existing);
            }
        }

        let definition = self.definition_for_bead(bead)?;
        let entry = definition.entry_node_key()?.to_string();
        let entry_node = definition
            .node(&entry)
            .ok_or_else(|| EngineError::NodeNotFound {
                workflow: definition.name.clone(),
                node: entry.clone(),
            })?;

        let execution = WorkflowExecution::new(definition.id, bead.id, entry.clone());
        let exec_id = execution.id;

        bead.context
            .insert(context::WORKFLOW_ID.into(), definition.id.to_string());
        bead.context
            .insert(context::WORKFLOW_EXEC_ID.into(), exec_id.to_string());
        bead.context.insert(context::WORKFLOW_NODE.into(), entry);
        bead.context.insert(
            context::REQUIRED_ROLE.into(),
            entry_node.effective_role().to_string(),
        );

        info!(bead_id = %bead.id, workflow = %definition.name, exec_id = %exec_id, "workflow attached to bead");
        self.executions.insert(exec_id, execution);
        Ok(exec_id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_execution(&self, exec_id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(&exec_id).map(|e| e.clone())
    }

    fn require_execution(&self, exec_id: Uuid) -> Result<WorkflowExecution> {
        self.get_execution(exec_id)
            .ok_or(EngineError::ExecutionNotFound(exec_id))
    }

    /// The node an execution currently sits on.
    pub fn get_current_node(&self, exec_id: Uuid) -> Result<WorkflowNode> {
        let exec = self.require_execution(exec_id)?;
        let definition = self.definition(exec.workflow_id)?;
        definition
            .node(&exec.current_node)
            .cloned()
            .ok_or(EngineError::NodeNotFound {
                workflow: definition.name,
                node: exec.current_node,
            })
    }

    /// The role the current node dispatches to (commit nodes pinned to the
    /// engineering manager).
    pub fn required_role(&self, exec_id: Uuid) -> Result<AgentRole> {
        Ok(self.get_current_node(exec_id)?.effective_role())
    }

    /// Whether the current node is ready for dispatch.
    ///
    /// False when the execution is not active, or when the node has timed
    /// out, in which case the engine internally advances on the timeout
    /// condition with the system actor before reporting not-ready.
    pub async fn is_node_ready(&self, exec_id: Uuid) -> Result<bool> {
        self.is_node_ready_at(exec_id, Utc::now()).await
    }

    pub async fn is_node_ready_at(&self, exec_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let exec = self.require_execution(exec_id)?;
        if exec.status != ExecutionStatus::Active {
            return Ok(false);
        }
        if self.check_node_timeout_at(exec_id, now).await? {
            return Ok(false);
        }
        Ok(true)
    }

    /// Lazily enforce the current node's timeout. Returns true when the
    /// node had timed out and the engine advanced on the timeout condition.
    pub async fn check_node_timeout(&self, exec_id: Uuid) -> Result<bool> {
        self.check_node_timeout_at(exec_id, Utc::now()).await
    }

    pub async fn check_node_timeout_at(&self, exec_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let exec = self.require_execution(exec_id)?;
        if exec.status != ExecutionStatus::Active {
            return Ok(false);
        }
        let node = self.get_current_node(exec_id)?;
        if node.timeout_minutes == 0 {
            return Ok(false);
        }
        let elapsed = now.signed_duration_since(exec.last_node_at);
        if elapsed <= Duration::minutes(node.timeout_minutes as i64) {
            return Ok(false);
        }

        warn!(
            exec_id = %exec_id,
            node = %exec.current_node,
            elapsed_mins = elapsed.num_minutes(),
            "node timed out; advancing on timeout condition"
        );
        self.advance_workflow_at(exec_id, EdgeCondition::Timeout, "system", None, now)
            .await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Advancement
    // -----------------------------------------------------------------------

    /// Advance an execution on a condition.
    ///
    /// Selects the highest-priority matching edge out of the current node
    /// and transitions accordingly; see the state machine rules in the
    /// match below. Returns the resulting status. Advancing a non-active
    /// execution is a no-op that reports the terminal status.
    pub async fn advance_workflow(
        &self,
        exec_id: Uuid,
        condition: EdgeCondition,
        actor: &str,
        result_data: Option<serde_json::Value>,
    ) -> Result<ExecutionStatus> {
        self.advance_workflow_at(exec_id, condition, actor, result_data, Utc::now())
            .await
    }

    pub async fn advance_workflow_at(
        &self,
        exec_id: Uuid,
        condition: EdgeCondition,
        actor: &str,
        result_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionStatus> {
        let advance_lock = self
            .advance_locks
            .entry(exec_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = advance_lock.lock().await;

        let mut exec = self
            .executions
            .get_mut(&exec_id)
            .ok_or(EngineError::ExecutionNotFound(exec_id))?;

        if exec.status != ExecutionStatus::Active {
            debug!(exec_id = %exec_id, status = ?exec.status, "advance on terminal execution is a no-op");
            return Ok(exec.status);
        }

        // Replaying the identical advance at the same wall-clock is a no-op.
        if let Some(last) = exec.history.last() {
            if last.condition == condition
                && last.actor == actor
                && last.result == result_data
                && last.timestamp == now
            {
                return Ok(exec.status);
            }
        }

        let definition = self.definition(exec.workflow_id)?;
        let entry = definition.entry_node_key()?.to_string();

        // Cycle guard: an execution that has already returned to the entry
        // node max_cycles times escalates on its next advance.
        if exec.cycle_count >= self.max_cycles {
            exec.status = ExecutionStatus::Escalated;
            let record = TransitionRecord {
                node_key: exec.current_node.clone(),
                actor: actor.to_string(),
                condition,
                attempt: exec.node_attempt_count,
                timestamp: now,
                result: result_data,
            };
            exec.history.push(record);
            warn!(exec_id = %exec_id, cycles = exec.cycle_count, "cycle guard tripped; execution escalated");
            return Ok(exec.status);
        }

        let current_key = exec.current_node.clone();
        let current_node =
            definition
                .node(&current_key)
                .cloned()
                .ok_or(EngineError::NodeNotFound {
                    workflow: definition.name.clone(),
                    node: current_key.clone(),
                })?;

        let selected = definition.select_edge(&current_key, condition).cloned();
        match selected {
            None => {
                // No matching edge. A node with no outgoing edges at all is
                // the workflow's terminal; anything else is a dead end.
                if definition.outgoing(&current_key).is_empty() {
                    exec.status = ExecutionStatus::Completed;
                    info!(exec_id = %exec_id, node = %current_key, "workflow completed");
                } else {
                    exec.status = ExecutionStatus::Failed;
                    warn!(
                        exec_id = %exec_id,
                        node = %current_key,
                        condition = ?condition,
                        "no matching edge; execution failed"
                    );
                }
                let attempt = exec.node_attempt_count;
                exec.history.push(TransitionRecord {
                    node_key: current_key,
                    actor: actor.to_string(),
                    condition,
                    attempt,
                    timestamp: now,
                    result: result_data,
                });
            }
            Some(edge) if edge.to_node == current_key => {
                // Self-edge: another attempt on the same node.
                exec.node_attempt_count += 1;
                let attempt = exec.node_attempt_count;
                exec.history.push(TransitionRecord {
                    node_key: current_key.clone(),
                    actor: actor.to_string(),
                    condition,
                    attempt,
                    timestamp: now,
                    result: result_data,
                });
                if exec.node_attempt_count > current_node.effective_max_attempts() {
                    exec.status = ExecutionStatus::Escalated;
                    warn!(
                        exec_id = %exec_id,
                        node = %current_key,
                        attempts = exec.node_attempt_count,
                        "attempt guard tripped; execution escalated"
                    );
                }
            }
            Some(edge) => {
                let target = edge.to_node.clone();
                exec.current_node = target.clone();
                exec.node_attempt_count = 1;
                exec.last_node_at = now;
                if target == entry {
                    exec.cycle_count += 1;
                }
                exec.history.push(TransitionRecord {
                    node_key: target.clone(),
                    actor: actor.to_string(),
                    condition,
                    attempt: 1,
                    timestamp: now,
                    result: result_data,
                });
                debug!(exec_id = %exec_id, from = %current_key, to = %target, condition = ?condition, "workflow advanced");

                if exec.cycle_count > self.max_cycles {
                    exec.status = ExecutionStatus::Escalated;
                    warn!(exec_id = %exec_id, cycles = exec.cycle_count, "cycle guard tripped; execution escalated");
                } else if definition.outgoing(&target).is_empty() {
                    exec.status = ExecutionStatus::Completed;
                    info!(exec_id = %exec_id, node = %target, "workflow completed");
                }
            }
        }

        Ok(exec.status)
    }

    // -----------------------------------------------------------------------
    // Escalation rendering
    // -----------------------------------------------------------------------

    /// Render a human-readable escalation title and description for a stuck
    /// execution.
    pub fn get_escalation_info(&self, exec_id: Uuid) -> Result<EscalationInfo> {
        let exec = self.require_execution(exec_id)?;
        let definition = self.definition(exec.workflow_id)?;
        let max_attempts = definition
            .node(&exec.current_node)
            .map(|n| n.effective_max_attempts())
            .unwrap_or(0);

        let title = format!("[CEO-Escalation] Workflow stuck: {}", exec.bead_id);

        let mut lines = vec![
            format!("Original bead: {}", exec.bead_id),
            format!("Workflow: {} ({:?})", definition.name, definition.workflow_type),
            format!("Status: {:?}", exec.status),
            format!("Cycles: {}/{}", exec.cycle_count, self.max_cycles),
            format!(
                "Current node: {} (attempt {}/{})",
                exec.current_node, exec.node_attempt_count, max_attempts
            ),
            String::new(),
            "Recent transitions:".to_string(),
        ];
        for record in exec.history.iter().rev().take(10).collect::<Vec<_>>().into_iter().rev() {
            lines.push(format!(
                "  {} <- {:?} by {} (attempt {})",
                record.node_key, record.condition, record.actor, record.attempt
            ));
        }
        lines.push(String::new());
        lines.push("Options:".to_string());
        lines.push("  1. Reset the workflow and retry from the entry node".to_string());
        lines.push("  2. Reassign the current node to a different role".to_string());
        lines.push("  3. Break the bead into smaller beads".to_string());
        lines.push("  4. Close the bead as won't-fix".to_string());

        Ok(EscalationInfo {
            title,
            description: lines.join("\n"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        default_bug_workflow, default_feature_workflow, NodeType, WorkflowEdge, WorkflowNode,
    };
    use loom_core::types::{Bead, Priority};

    fn engine_with_defaults() -> WorkflowEngine {
        let engine = WorkflowEngine::new(3);
        engine.register_definition(default_bug_workflow()).unwrap();
        engine.register_definition(default_feature_workflow()).unwrap();
        engine
    }

    fn bug_bead() -> Bead {
        Bead::new("crash on save", "loom", BeadType::Bug, Priority::P1)
    }

    #[tokio::test]
    async fn ensure_attaches_workflow_and_writes_pointers() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();

        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        assert_eq!(
            bead.context.get(context::WORKFLOW_EXEC_ID).unwrap(),
            &exec_id.to_string()
        );
        assert_eq!(bead.context.get(context::WORKFLOW_NODE).unwrap(), "investigate");
        assert_eq!(bead.context.get(context::REQUIRED_ROLE).unwrap(), "qa-engineer");

        let exec = engine.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Active);
        assert_eq!(exec.current_node, "investigate");
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();

        let first = engine.ensure_bead_has_workflow(&mut bead).unwrap();
        let snapshot = bead.context.clone();
        let second = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        assert_eq!(first, second);
        assert_eq!(bead.context, snapshot);
    }

    #[tokio::test]
    async fn ensure_without_definitions_errors() {
        let engine = WorkflowEngine::new(3);
        let mut bead = bug_bead();
        let err = engine.ensure_bead_has_workflow(&mut bead).unwrap_err();
        assert!(matches!(err, EngineError::NoWorkflowForBead { .. }));
    }

    #[tokio::test]
    async fn bug_workflow_runs_to_completion() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        // investigate -> fix -> verify -> land; the land node has no
        // outgoing edges so arrival completes the execution.
        for _ in 0..2 {
            let status = engine
                .advance_workflow(exec_id, EdgeCondition::Success, "agent", None)
                .await
                .unwrap();
            assert_eq!(status, ExecutionStatus::Active);
        }
        let status = engine
            .advance_workflow(exec_id, EdgeCondition::Success, "agent", None)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Completed);

        let exec = engine.get_execution(exec_id).unwrap();
        assert_eq!(exec.current_node, "land");
        assert_eq!(exec.history.len(), 3);
        assert!(!engine.is_node_ready(exec_id).await.unwrap());
    }

    #[tokio::test]
    async fn commit_node_role_is_pinned_to_em() {
        // A workflow whose commit node declares software-engineer.
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("pinned", WorkflowType::Custom)
            .with_default(true)
            .with_node(WorkflowNode::new("land", NodeType::Commit, AgentRole::SoftwareEngineer))
            .with_edge(WorkflowEdge::entry("land"));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        assert_eq!(
            engine.required_role(exec_id).unwrap(),
            AgentRole::EngineeringManager
        );
        assert_eq!(
            bead.context.get(context::REQUIRED_ROLE).unwrap(),
            "engineering-manager"
        );
    }

    #[tokio::test]
    async fn self_edge_attempts_escalate_past_max() {
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("retry", WorkflowType::Custom)
            .with_default(true)
            .with_node(
                WorkflowNode::new("work", NodeType::Task, AgentRole::SoftwareEngineer)
                    .with_max_attempts(2),
            )
            .with_node(WorkflowNode::new("done", NodeType::Verify, AgentRole::QaEngineer))
            .with_edge(WorkflowEdge::entry("work"))
            .with_edge(WorkflowEdge::new("work", "work", EdgeCondition::Failure))
            .with_edge(WorkflowEdge::new("work", "done", EdgeCondition::Success));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        // Attempt 1 is the initial claim; first failure makes it 2 (at max).
        let status = engine
            .advance_workflow(exec_id, EdgeCondition::Failure, "agent", None)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Active);
        assert_eq!(engine.get_execution(exec_id).unwrap().node_attempt_count, 2);

        // Second failure exceeds max_attempts and escalates.
        let status = engine
            .advance_workflow(exec_id, EdgeCondition::Failure, "agent", None)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Escalated);
    }

    #[tokio::test]
    async fn cycle_guard_escalates_on_fourth_pass() {
        // investigate (task, QA) -> pm_review (approval, PM);
        // pm_review rejects back to investigate.
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("pingpong", WorkflowType::Custom)
            .with_default(true)
            .with_node(WorkflowNode::new("investigate", NodeType::Task, AgentRole::QaEngineer))
            .with_node(WorkflowNode::new("pm_review", NodeType::Approval, AgentRole::ProjectManager))
            .with_edge(WorkflowEdge::entry("investigate"))
            .with_edge(WorkflowEdge::new("investigate", "pm_review", EdgeCondition::Success))
            .with_edge(WorkflowEdge::new("pm_review", "investigate", EdgeCondition::Rejected));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        // Three success/reject round-trips bring cycle_count to 3.
        for round in 1..=3u32 {
            engine
                .advance_workflow(exec_id, EdgeCondition::Success, "qa", None)
                .await
                .unwrap();
            let status = engine
                .advance_workflow(exec_id, EdgeCondition::Rejected, "pm", None)
                .await
                .unwrap();
            assert_eq!(status, ExecutionStatus::Active);
            assert_eq!(engine.get_execution(exec_id).unwrap().cycle_count, round);
        }

        // The fourth success trips the cycle guard.
        let status = engine
            .advance_workflow(exec_id, EdgeCondition::Success, "qa", None)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Escalated);
    }

    #[tokio::test]
    async fn replayed_advance_is_a_no_op() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        let now = Utc::now();
        engine
            .advance_workflow_at(exec_id, EdgeCondition::Success, "agent", None, now)
            .await
            .unwrap();
        engine
            .advance_workflow_at(exec_id, EdgeCondition::Success, "agent", None, now)
            .await
            .unwrap();

        let exec = engine.get_execution(exec_id).unwrap();
        assert_eq!(exec.history.len(), 1);
        assert_eq!(exec.current_node, "fix");
    }

    #[tokio::test]
    async fn advance_on_terminal_execution_is_a_no_op() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        for _ in 0..4 {
            engine
                .advance_workflow(exec_id, EdgeCondition::Success, "agent", None)
                .await
                .unwrap();
        }
        let exec_before = engine.get_execution(exec_id).unwrap();
        assert_eq!(exec_before.status, ExecutionStatus::Completed);

        let status = engine
            .advance_workflow(exec_id, EdgeCondition::Failure, "agent", None)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(
            engine.get_execution(exec_id).unwrap().history.len(),
            exec_before.history.len()
        );
    }

    #[tokio::test]
    async fn timeout_without_edge_fails_execution() {
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("timed", WorkflowType::Custom)
            .with_default(true)
            .with_node(
                WorkflowNode::new("work", NodeType::Task, AgentRole::SoftwareEngineer)
                    .with_timeout_minutes(5),
            )
            .with_node(WorkflowNode::new("done", NodeType::Verify, AgentRole::QaEngineer))
            .with_edge(WorkflowEdge::entry("work"))
            .with_edge(WorkflowEdge::new("work", "done", EdgeCondition::Success));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        // Six minutes later the node has timed out; no timeout edge exists,
        // and the work node has other outgoing edges, so the execution fails.
        let later = Utc::now() + Duration::minutes(6);
        let ready = engine.is_node_ready_at(exec_id, later).await.unwrap();
        assert!(!ready);

        let exec = engine.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.history.last().unwrap().actor, "system");
        assert_eq!(exec.history.last().unwrap().condition, EdgeCondition::Timeout);
    }

    #[tokio::test]
    async fn timeout_with_edge_advances() {
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("timed", WorkflowType::Custom)
            .with_default(true)
            .with_node(
                WorkflowNode::new("work", NodeType::Task, AgentRole::SoftwareEngineer)
                    .with_timeout_minutes(5),
            )
            .with_node(WorkflowNode::new("triage", NodeType::Task, AgentRole::EngineeringManager))
            .with_edge(WorkflowEdge::entry("work"))
            .with_edge(WorkflowEdge::new("work", "triage", EdgeCondition::Timeout));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();

        let later = Utc::now() + Duration::minutes(6);
        let timed_out = engine.check_node_timeout_at(exec_id, later).await.unwrap();
        assert!(timed_out);

        let exec = engine.get_execution(exec_id).unwrap();
        // The triage node has no outgoing edges, so arrival completes it.
        assert_eq!(exec.current_node, "triage");
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn timeout_boundary_is_strict() {
        let engine = WorkflowEngine::new(3);
        let def = WorkflowDefinition::new("timed", WorkflowType::Custom)
            .with_default(true)
            .with_node(
                WorkflowNode::new("work", NodeType::Task, AgentRole::SoftwareEngineer)
                    .with_timeout_minutes(5),
            )
            .with_edge(WorkflowEdge::entry("work"));
        engine.register_definition(def).unwrap();

        let mut bead = Bead::new("t", "loom", BeadType::Task, Priority::P2);
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();
        let exec = engine.get_execution(exec_id).unwrap();

        // Exactly five minutes is not yet a timeout.
        let at_limit = exec.last_node_at + Duration::minutes(5);
        assert!(!engine.check_node_timeout_at(exec_id, at_limit).await.unwrap());
        assert!(engine.is_node_ready_at(exec_id, at_limit).await.unwrap());
    }

    #[tokio::test]
    async fn escalation_info_renders_context() {
        let engine = engine_with_defaults();
        let mut bead = bug_bead();
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();
        engine
            .advance_workflow(exec_id, EdgeCondition::Success, "qa-1", None)
            .await
            .unwrap();

        let info = engine.get_escalation_info(exec_id).unwrap();
        assert!(info.title.starts_with("[CEO-Escalation] Workflow stuck:"));
        assert!(info.title.contains(&bead.id.to_string()));
        assert!(info.description.contains("default-bug"));
        assert!(info.description.contains("Current node: fix"));
        assert!(info.description.contains("Options:"));
        assert!(info.description.contains("qa-1"));
    }

    #[tokio::test]
    async fn project_scoped_definition_wins() {
        let engine = WorkflowEngine::new(3);
        engine.register_definition(default_bug_workflow()).unwrap();
        let scoped = WorkflowDefinition::new("loom-bug", WorkflowType::Bug)
            .with_project("loom")
            .with_node(WorkflowNode::new("triage", NodeType::Task, AgentRole::QaEngineer))
            .with_edge(WorkflowEdge::entry("triage"));
        engine.register_definition(scoped).unwrap();

        let mut bead = bug_bead();
        let exec_id = engine.ensure_bead_has_workflow(&mut bead).unwrap();
        assert_eq!(engine.get_execution(exec_id).unwrap().current_node, "triage");
    }
}
