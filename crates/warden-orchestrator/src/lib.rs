//! Governed multi-agent job execution.
//!
//! Decomposes jobs into dependency graphs, dispatches ready subtasks to
//! specialist agents under per-agent and global concurrency limits, and runs
//! every result through validation, risk classification and, when required,
//! human approval. Per-agent circuit breakers isolate failing agents and a
//! consistency monitor watches validator scores for drift.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level engine: submit, wait, cancel, approve.
//! - [`AgentRegistry`] — Agents by capability, least-loaded first.
//! - [`Decomposer`] — Job request to [`SubtaskGraph`].
//! - [`SupervisorValidator`] — Deterministic rules plus a fuzzy consistency score.
//! - [`RiskClassifier`] — Pure (subtask, result) to [`warden_core::RiskTier`].
//! - [`ApprovalGate`] — First-writer-wins approval with per-tier timeouts.
//! - [`ConsistencyMonitor`] — Rolling score statistics and drift alerts.
//! - [`WardenConfig`] — TOML configuration for all of the above.

/// Engine configuration.
pub mod config;
/// Job to dependency graph.
pub mod decomposer;
/// Orchestration engine.
pub mod engine;
/// Human-in-the-loop approval gate.
pub mod gate;
/// Per-job subtask graph.
pub mod graph;
/// Consistency monitoring and drift detection.
pub mod monitor;
/// Reactions to drift.
pub mod policy;
/// Agent registry and load-aware selection.
pub mod registry;
/// State reconstruction from the audit log.
pub mod replay;
/// Risk classification.
pub mod risk;
/// Shared orchestration types (Job, Subtask, ExecutionResult, etc.).
pub mod types;
/// Result validation.
pub mod validator;

pub use config::{AuditConfig, OrchestratorConfig, WardenConfig};
pub use decomposer::Decomposer;
pub use engine::{Orchestrator, OrchestratorBuilder};
pub use gate::{
    ApprovalConfig, ApprovalGate, ApprovalTicket, AutoApproveChannel, CallbackApprovalChannel,
    TierTimeout, TimeoutAction, VerdictFuture, TIMEOUT_REVIEWER,
};
pub use graph::SubtaskGraph;
pub use monitor::{
    ConsistencyMetric, ConsistencyMonitor, DriftAlert, DriftConfig, DriftReason, DriftSignal,
    DriftStatus, GLOBAL_SCOPE,
};
pub use policy::{ConfiguredDriftPolicy, DriftAction, DriftPolicy, DriftResponse};
pub use registry::{AgentDescriptor, AgentLease, AgentRegistry, RegisteredAgent};
pub use replay::{replay, ReplayState};
pub use risk::{RiskClassifier, RiskPolicy};
pub use types::{
    ExecutionResult, ImpactProfile, Job, JobReport, JobRequest, JobStatus, JobTicket, Stage,
    StageTask, Subtask, SubtaskReport, SubtaskStatus,
};
pub use validator::{RuleViolation, SupervisorValidator, ValidationConfig, ValidationReport};
