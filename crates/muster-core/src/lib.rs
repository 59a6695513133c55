//! Core types and error definitions for the Muster orchestration core.
//!
//! This crate provides the foundational types shared across all Muster
//! crates: the unified error taxonomy, the agent/task/resource data model,
//! and the inter-agent message envelope.
//!
//! # Main types
//!
//! - [`MusterError`] — Unified error enum for all Muster subsystems.
//! - [`MusterResult`] — Convenience alias for `Result<T, MusterError>`.
//! - [`Capability`] — A named, versioned contract an agent can fulfill.
//! - [`Agent`] / [`AgentStatus`] — A registered agent and its liveness state.
//! - [`Task`] / [`TaskStatus`] — A unit of work and its lifecycle.
//! - [`ActionProposal`] — An agent's candidate effect, subject to
//!   conflict resolution.
//! - [`Envelope`] — A brokered message with per-pair sequence numbering.
//! - [`MetricSample`] — A single observed metric value.

/// Unified error taxonomy.
pub mod error;
/// Inter-agent message envelope.
pub mod message;
/// Agent, task, resource, proposal, and metric types.
pub mod types;

pub use error::{MusterError, MusterResult};
pub use message::{Envelope, Recipient};
pub use types::{
    ActionProposal, Agent, AgentSpec, AgentStatus, Capability, MetricSample, Task, TaskSpec,
    TaskStatus,
};
