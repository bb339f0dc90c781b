use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loom_core::types::AgentRole;

// ---------------------------------------------------------------------------
// NodeType / EdgeCondition / WorkflowType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    Approval,
    Commit,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Success,
    Failure,
    Approved,
    Rejected,
    Timeout,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Bug,
    Feature,
    Ui,
    Custom,
}

/// Max attempts used when a node definition omits one (stores zero).
pub const DEFAULT_NODE_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// WorkflowNode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique within the workflow.
    pub key: String,
    pub node_type: NodeType,
    pub role_required: AgentRole,
    pub max_attempts: u32,
    /// Zero means no timeout.
    pub timeout_minutes: u32,
    pub instructions: String,
}

impl WorkflowNode {
    pub fn new(key: impl Into<String>, node_type: NodeType, role_required: AgentRole) -> Self {
        Self {
            key: key.into(),
            node_type,
            role_required,
            max_attempts: 3,
            timeout_minutes: 0,
            instructions: String::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_minutes(mut self, timeout_minutes: u32) -> Self {
        self.timeout_minutes = timeout_minutes;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// The attempt cap this node enforces; zero falls back to the default.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            DEFAULT_NODE_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }

    /// The role this node actually dispatches to. Commit nodes are
    /// role-pinned to the engineering manager regardless of what the
    /// definition declared.
    pub fn effective_role(&self) -> AgentRole {
        if self.node_type == NodeType::Commit {
            AgentRole::EngineeringManager
        } else {
            self.role_required
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEdge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// `None` marks the entry edge.
    pub from_node: Option<String>,
    pub to_node: String,
    pub condition: EdgeCondition,
    pub priority: i32,
}

impl WorkflowEdge {
    pub fn entry(to_node: impl Into<String>) -> Self {
        Self {
            from_node: None,
            to_node: to_node.into(),
            condition: EdgeCondition::Success,
            priority: 0,
        }
    }

    pub fn new(
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            from_node: Some(from_node.into()),
            to_node: to_node.into(),
            condition,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow `{0}` has no entry edge")]
    NoEntryEdge(String),
    #[error("workflow `{0}` has more than one entry edge")]
    MultipleEntryEdges(String),
    #[error("workflow `{workflow}` references unknown node `{node}`")]
    UnknownNode { workflow: String, node: String },
    #[error("workflow `{workflow}` has duplicate node key `{node}`")]
    DuplicateNode { workflow: String, node: String },
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A small DAG of typed nodes governing the lifecycle of beads of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub is_default: bool,
    /// When set, the definition only applies to beads of this project.
    pub project_id: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, workflow_type: WorkflowType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workflow_type,
            is_default: false,
            project_id: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, key: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// The key of the entry node, designated by the single empty-from edge.
    pub fn entry_node_key(&self) -> Result<&str, DefinitionError> {
        let mut entries = self.edges.iter().filter(|e| e.from_node.is_none());
        let first = entries
            .next()
            .ok_or_else(|| DefinitionError::NoEntryEdge(self.name.clone()))?;
        if entries.next().is_some() {
            return Err(DefinitionError::MultipleEntryEdges(self.name.clone()));
        }
        Ok(&first.to_node)
    }

    /// All outgoing edges of a node, in insertion order.
    pub fn outgoing(&self, key: &str) -> Vec<&WorkflowEdge> {
        self.edges
            .iter()
            .filter(|e| e.from_node.as_deref() == Some(key))
            .collect()
    }

    /// Select the edge to follow for a (node, condition) pair: the
    /// highest-priority matching edge, ties resolved by insertion order.
    pub fn select_edge(&self, from: &str, condition: EdgeCondition) -> Option<&WorkflowEdge> {
        let mut best: Option<&WorkflowEdge> = None;
        for edge in &self.edges {
            if edge.from_node.as_deref() != Some(from) || edge.condition != condition {
                continue;
            }
            match best {
                // Strict comparison keeps the earliest edge among equals.
                Some(current) if edge.priority <= current.priority => {}
                _ => best = Some(edge),
            }
        }
        best
    }

    /// Validate structural invariants: one entry edge whose target exists,
    /// unique node keys, and no dangling edge endpoints.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let entry = self.entry_node_key()?;
        if self.node(entry).is_none() {
            return Err(DefinitionError::UnknownNode {
                workflow: self.name.clone(),
                node: entry.to_string(),
            });
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|n| n.key == node.key) {
                return Err(DefinitionError::DuplicateNode {
                    workflow: self.name.clone(),
                    node: node.key.clone(),
                });
            }
        }

        for edge in &self.edges {
            if let Some(ref from) = edge.from_node {
                if self.node(from).is_none() {
                    return Err(DefinitionError::UnknownNode {
                        workflow: self.name.clone(),
                        node: from.clone(),
                    });
                }
            }
            if self.node(&edge.to_node).is_none() {
                return Err(DefinitionError::UnknownNode {
                    workflow: self.name.clone(),
                    node: edge.to_node.clone(),
                });
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in defaults
// ---------------------------------------------------------------------------

/// The default bug workflow: investigate, fix, verify, land.
pub fn default_bug_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("default-bug", WorkflowType::Bug)
        .with_default(true)
        .with_node(
            WorkflowNode::new("investigate", NodeType::Task, AgentRole::QaEngineer)
                .with_instructions("Reproduce the bug and identify the root cause."),
        )
        .with_node(
            WorkflowNode::new("fix", NodeType::Task, AgentRole::SoftwareEngineer)
                .with_instructions("Implement a fix for the identified root cause."),
        )
        .with_node(
            WorkflowNode::new("verify", NodeType::Verify, AgentRole::QaEngineer)
                .with_instructions("Verify the fix: run the reproduction and the test suite."),
        )
        .with_node(
            WorkflowNode::new("land", NodeType::Commit, AgentRole::EngineeringManager)
                .with_instructions("Review and commit the verified fix."),
        )
        .with_edge(WorkflowEdge::entry("investigate"))
        .with_edge(WorkflowEdge::new("investigate", "fix", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("fix", "verify", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("verify", "land", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("verify", "fix", EdgeCondition::Failure))
}

/// The default feature workflow: design gets a PM approval gate before
/// implementation; verification failures loop back to implement.
pub fn default_feature_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("default-feature", WorkflowType::Feature)
        .with_default(true)
        .with_node(
            WorkflowNode::new("design", NodeType::Task, AgentRole::EngineeringManager)
                .with_instructions("Draft the implementation approach."),
        )
        .with_node(
            WorkflowNode::new("pm_review", NodeType::Approval, AgentRole::ProjectManager)
                .with_instructions("Approve or reject the proposed approach."),
        )
        .with_node(
            WorkflowNode::new("implement", NodeType::Task, AgentRole::SoftwareEngineer)
                .with_instructions("Implement the approved design."),
        )
        .with_node(
            WorkflowNode::new("verify", NodeType::Verify, AgentRole::QaEngineer)
                .with_instructions("Verify the implementation against the design."),
        )
        .with_node(
            WorkflowNode::new("land", NodeType::Commit, AgentRole::EngineeringManager)
                .with_instructions("Review and commit the verified change."),
        )
        .with_edge(WorkflowEdge::entry("design"))
        .with_edge(WorkflowEdge::new("design", "pm_review", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("pm_review", "implement", EdgeCondition::Approved))
        .with_edge(WorkflowEdge::new("pm_review", "design", EdgeCondition::Rejected))
        .with_edge(WorkflowEdge::new("implement", "verify", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("verify", "land", EdgeCondition::Success))
        .with_edge(WorkflowEdge::new("verify", "implement", EdgeCondition::Failure))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
