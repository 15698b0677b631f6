//! Core types and error definitions for the Warden governance engine.
//!
//! This crate provides the foundational types shared across all Warden crates:
//! the unified error enum, risk tiers and the approval vocabulary used by the
//! approval gate and its reviewer channels.
//!
//! # Main types
//!
//! - [`WardenError`] — Unified error enum for all Warden subsystems.
//! - [`WardenResult`] — Convenience alias for `Result<T, WardenError>`.
//! - [`RiskTier`] — Ordered risk classification of a subtask result.
//! - [`ApprovalRecord`] — An immutable reviewer decision.
//! - [`ApprovalChannel`] — Pluggable transport for approval requests.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// Error taxonomy.
pub mod error;

pub use approval::{
    ApprovalChannel, ApprovalDecision, ApprovalRecord, ApprovalRequest, ReviewVerdict, RiskTier,
};
pub use error::{WardenError, WardenResult};
