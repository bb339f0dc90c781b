use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl BeadStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// A closed bead stays closed unless explicitly reopened by an
    /// authorized actor, which is modelled as the Closed -> Open edge.
    pub fn can_transition_to(&self, target: &BeadStatus) -> bool {
        matches!(
            (self, target),
            (BeadStatus::Open, BeadStatus::InProgress)
                | (BeadStatus::Open, BeadStatus::Blocked)
                | (BeadStatus::Open, BeadStatus::Closed)
                | (BeadStatus::InProgress, BeadStatus::Open)
                | (BeadStatus::InProgress, BeadStatus::Blocked)
                | (BeadStatus::InProgress, BeadStatus::Closed)
                | (BeadStatus::Blocked, BeadStatus::Open)
                | (BeadStatus::Blocked, BeadStatus::Closed)
                | (BeadStatus::Closed, BeadStatus::Open)
        )
    }
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Blocked => "blocked",
            BeadStatus::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Numeric rank for sorting (lower = more urgent).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// BeadType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Bug,
    Feature,
    Decision,
    Epic,
}

impl BeadType {
    /// The role a bead of this type is routed to when no workflow node
    /// dictates otherwise.
    pub fn default_role(&self) -> AgentRole {
        match self {
            BeadType::Bug => AgentRole::QaEngineer,
            BeadType::Feature => AgentRole::EngineeringManager,
            BeadType::Decision => AgentRole::Ceo,
            BeadType::Epic => AgentRole::ProjectManager,
            BeadType::Task => AgentRole::SoftwareEngineer,
        }
    }
}

impl fmt::Display for BeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BeadType::Task => "task",
            BeadType::Bug => "bug",
            BeadType::Feature => "feature",
            BeadType::Decision => "decision",
            BeadType::Epic => "epic",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// The atomic unit of work. All cross-cycle memory (dispatch counters,
/// workflow pointers, loop-detector history, error trails, escalation
/// markers) lives in the flat `context` string map so it travels with the
/// bead through the store and over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: BeadStatus,
    pub priority: Priority,
    pub bead_type: BeadType,
    pub project_id: String,
    pub assignee: Option<Uuid>,
    /// Bead ids this bead is blocked by, in insertion order.
    pub depends_on: Vec<Uuid>,
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bead {
    pub fn new(
        title: impl Into<String>,
        project_id: impl Into<String>,
        bead_type: BeadType,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            status: BeadStatus::Open,
            priority,
            bead_type,
            project_id: project_id.into(),
            assignee: None,
            depends_on: Vec::new(),
            context: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mutate the bead's status, stamping `updated_at`.
    pub fn set_status(&mut self, status: BeadStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    SoftwareEngineer,
    QaEngineer,
    EngineeringManager,
    ProjectManager,
    Ceo,
    /// Blocker role; scheduled like any other role.
    Ralph,
}

impl AgentRole {
    /// Parse a role from its wire/display name. Unknown names map to None.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "software-engineer" => Some(AgentRole::SoftwareEngineer),
            "qa-engineer" => Some(AgentRole::QaEngineer),
            "engineering-manager" | "Engineering Manager" => Some(AgentRole::EngineeringManager),
            "project-manager" => Some(AgentRole::ProjectManager),
            "ceo" => Some(AgentRole::Ceo),
            "ralph" => Some(AgentRole::Ralph),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentRole::SoftwareEngineer => "software-engineer",
            AgentRole::QaEngineer => "qa-engineer",
            AgentRole::EngineeringManager => "engineering-manager",
            AgentRole::ProjectManager => "project-manager",
            AgentRole::Ceo => "ceo",
            AgentRole::Ralph => "ralph",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentStatus / Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Terminated,
}

/// A logical worker identity. The role is immutable for the agent's
/// lifetime; an agent in `Working` owns exactly one bead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub persona: Option<String>,
    pub status: AgentStatus,
    pub project_id: String,
    pub last_heartbeat: DateTime<Utc>,
    /// The bead this agent is working on, when status is `Working`.
    pub current_bead: Option<Uuid>,
    /// Last time this agent was dispatched to; drives oldest-first rotation.
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: AgentRole, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            persona: None,
            status: AgentStatus::Idle,
            project_id: project_id.into(),
            last_heartbeat: now,
            current_bead: None,
            last_activity: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenaiCompatible,
    Anthropic,
    Local,
    Vllm,
    Ollama,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Active,
    Healthy,
    Unhealthy,
    Disabled,
}

impl ProviderStatus {
    /// Whether the provider may serve traffic.
    pub fn is_servable(&self) -> bool {
        matches!(self, ProviderStatus::Active | ProviderStatus::Healthy)
    }
}

/// An LLM endpoint the control plane may direct agents to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Effective model name; may be rewritten after model-not-found recovery.
    pub model: String,
    pub status: ProviderStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Latency of the most recent heartbeat probe, in milliseconds.
    pub heartbeat_latency_ms: f64,
    /// Exponential moving average of request latency, in milliseconds.
    pub avg_request_latency_ms: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Model parameter count, in billions. Zero means unknown.
    pub model_size_b: f64,
    /// Cost per million tokens, in dollars. Zero means unknown.
    pub cost_per_mtok: f64,
    pub context_window: u32,
    /// Dynamic composite capability score in [0,1].
    pub score: f64,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        provider_type: ProviderType,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider_type,
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            status: ProviderStatus::Pending,
            last_heartbeat_at: None,
            heartbeat_latency_ms: 0.0,
            avg_request_latency_ms: 0.0,
            total_requests: 0,
            successful_requests: 0,
            model_size_b: 0.0,
            cost_per_mtok: 0.0,
            context_window: 0,
            score: 0.0,
        }
    }

    pub fn with_model_size_b(mut self, size_b: f64) -> Self {
        self.model_size_b = size_b;
        self
    }

    pub fn with_cost_per_mtok(mut self, cost: f64) -> Self {
        self.cost_per_mtok = cost;
        self
    }

    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }
}

// ---------------------------------------------------------------------------
// ComplexityLevel
// ---------------------------------------------------------------------------

/// Estimated bead complexity, used to steer provider selection towards a
/// matching model-size tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

impl ComplexityLevel {
    /// Model-size tier bounds (in billions of parameters) for this level.
    ///
    /// A provider whose model size falls inside the half-open range
    /// `[min, max)` is considered a tier match.
    pub fn size_tier(&self) -> (f64, f64) {
        match self {
            ComplexityLevel::Trivial => (0.0, 8.0),
            ComplexityLevel::Simple => (8.0, 20.0),
            ComplexityLevel::Moderate => (20.0, 70.0),
            ComplexityLevel::Complex => (70.0, f64::INFINITY),
        }
    }

    /// Whether `size_b` falls inside this level's tier. Unknown sizes (0)
    /// never match so they fall back to score ordering.
    pub fn matches_size(&self, size_b: f64) -> bool {
        let (min, max) = self.size_tier();
        size_b > 0.0 && size_b >= min && size_b < max
    }
}

/// Estimate complexity from bead characteristics.
///
/// Heuristic: epics are always complex, decisions are trivial (a human or
/// CEO-role agent reads them), otherwise description length drives the
/// estimate the way prompt size does for model routing.
pub fn estimate_complexity(bead: &Bead) -> ComplexityLevel {
    match bead.bead_type {
        BeadType::Epic => ComplexityLevel::Complex,
        BeadType::Decision => ComplexityLevel::Trivial,
        _ => {
            let desc_len = bead.description.as_deref().map_or(0, str::len);
            if desc_len < 100 {
                ComplexityLevel::Trivial
            } else if desc_len < 500 {
                ComplexityLevel::Simple
            } else if desc_len < 2000 {
                ComplexityLevel::Moderate
            } else {
                ComplexityLevel::Complex
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
