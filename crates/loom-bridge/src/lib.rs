//! In-process message bus and wire protocol for the loom control plane.
//!
//! The production deployment speaks these same payloads over a durable
//! stream; this crate models the interface with a broadcast bus so the
//! dispatcher, workers, and tests share one contract.

pub mod event_bus;
pub mod protocol;

pub use event_bus::EventBus;
pub use protocol::{
    subjects, BusMessage, DispatchEvent, ResultMessage, ResultOutcome, TaskMessage,
};
