//! Per-bead workflow state machines.
//!
//! A workflow is a small DAG of typed nodes (task / approval / commit /
//! verify) with condition-labelled edges. Each bead gets one live execution
//! that the engine advances on agent results, guarded by cycle and attempt
//! limits; when a guard trips, the execution escalates and the dispatcher
//! turns that into a CEO decision bead.

pub mod definition;
pub mod engine;
pub mod execution;

pub use definition::{
    DefinitionError, EdgeCondition, NodeType, WorkflowDefinition, WorkflowEdge, WorkflowNode,
    WorkflowType,
};
pub use engine::{EngineError, EscalationInfo, WorkflowEngine};
pub use execution::{ExecutionStatus, TransitionRecord, WorkflowExecution};
