//! The Muster orchestration runtime.
//!
//! Coordinates a pool of capability-bound agents: accepts tasks, matches
//! them to eligible agents, brokers inter-agent messages, allocates finite
//! shared resources, reconciles concurrent action proposals into a
//! conflict-free set, and observes system health.
//!
//! # Main types
//!
//! - [`Engine`] — Wires every component together and runs the background
//!   scheduling, liveness, and reconciliation loops.
//! - [`AgentRegistry`] — Agent identity, capabilities, liveness, status.
//! - [`TaskScheduler`] — Task lifecycle and priority-ordered assignment.
//! - [`MessageBroker`] — Bounded per-agent mailboxes with ordering.
//! - [`ResourceManager`] — Capacity ledger with priority-ordered grants.
//! - [`Coordinator`] — Deterministic proposal conflict resolution.
//! - [`Monitor`] — Metric collection and threshold alerting.

/// Bounded per-agent mailboxes and broadcast delivery.
pub mod broker;
/// Runtime configuration with serde defaults.
pub mod config;
/// Windowed proposal reconciliation.
pub mod coordinator;
/// Component wiring and background loops.
pub mod engine;
/// Metric collection and threshold alerting.
pub mod monitor;
/// Agent table and liveness sweeps.
pub mod registry;
/// Finite-resource ledger and pending-request grants.
pub mod resources;
/// Task table, state machine, and assignment ordering.
pub mod scheduler;
/// JSON snapshot persistence for restart recovery.
pub mod snapshot;

pub use broker::{MessageBroker, OverflowPolicy};
pub use config::{ResourceDecl, RuntimeConfig};
pub use coordinator::{Coordinator, Resolution};
pub use engine::Engine;
pub use monitor::{Alert, Monitor, ThresholdOp, ThresholdRule};
pub use registry::AgentRegistry;
pub use resources::ResourceManager;
pub use scheduler::{CancelOutcome, TaskScheduler};
pub use snapshot::{FileStateStore, Snapshot, StateStore};
