//! Daemon wiring for the loom control plane.

pub mod daemon;

pub use daemon::Daemon;
