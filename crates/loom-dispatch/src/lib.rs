//! The dispatch core: scheduling, loop detection, escalation, and the
//! periodic repo self-audit.
//!
//! The dispatcher is the heartbeat of the control plane. Each tick it scans
//! open beads, consults the workflow engine and the loop detector, matches
//! beads to idle agents and active providers, and publishes tasks. Agent
//! results advance the per-bead workflow; guard violations and hop-limit
//! breaches become P0 CEO decision beads.

pub mod audit;
pub mod dispatcher;
pub mod escalation;
pub mod loop_detector;
pub mod provider_errors;
pub mod shutdown;

pub use audit::{AuditReport, AuditRunner, CommandOutput, CommandRunner, Finding, FindingType, ShellRunner};
pub use dispatcher::{DispatchError, Dispatcher, PassReport};
pub use escalation::{Escalator, EscalatorError, StoreEscalator};
pub use loop_detector::{ActionRecord, LoopDetector, ProgressMetrics};
pub use provider_errors::{bead_has_provider_errors, is_provider_error};
pub use shutdown::ShutdownSignal;
