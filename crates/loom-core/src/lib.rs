//! Core library for loom — domain types, bead context conventions, the
//! relational store, and configuration.
//!
//! This crate is the foundation of the loom control plane:
//! - Bead / Agent / Provider domain types and their lifecycle rules
//! - Well-known bead context keys (the cross-cycle memory bag)
//! - SQLite-backed store for beads, dependencies, agents, providers, and
//!   workflow records
//! - TOML configuration with clamped tunables

pub mod config;
pub mod context;
pub mod store;
pub mod types;
