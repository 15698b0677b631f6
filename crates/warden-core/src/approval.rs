//! Risk tiers and approval types for human-in-the-loop gating.
//!
//! These types live in `warden-core` so that the orchestrator (which owns the
//! approval gate) and front ends such as the CLI prompt can share them.

use crate::WardenResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk tier of a subtask result. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Routine, reversible work.
    Low,
    /// Noticeable impact.
    Medium,
    /// Needs a reviewer by default.
    High,
    /// Irreversible or very large impact.
    Critical,
}

impl RiskTier {
    /// Lenient parser used for CLI flags; unknown input maps to `Medium`.
    pub fn parse_level(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => RiskTier::Low,
            "medium" => RiskTier::Medium,
            "high" => RiskTier::High,
            "critical" => RiskTier::Critical,
            _ => RiskTier::Medium,
        }
    }

    /// The next tier up, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            RiskTier::Low => RiskTier::Medium,
            RiskTier::Medium => RiskTier::High,
            RiskTier::High | RiskTier::Critical => RiskTier::Critical,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
            RiskTier::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// The result may be released.
    Approved,
    /// The result is withheld.
    Rejected,
}

/// A request sent to a reviewer for sign-off on a subtask result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Subtask whose result is under review.
    pub subtask_id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Capability the subtask asked for.
    pub capability: String,
    /// Agent that produced the result.
    pub agent_id: Option<String>,
    /// Tier assigned by the classifier.
    pub tier: RiskTier,
    /// Why the result was routed to review (tier, compliance hit, override).
    pub reason: String,
    /// Short preview of the result under review.
    pub context: String,
    /// When the gate opened the request.
    pub requested_at: DateTime<Utc>,
}

/// What a reviewer hands back through an [`ApprovalChannel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// Approve or reject.
    pub decision: ApprovalDecision,
    /// Who decided, e.g. a user name or `system:auto`.
    pub reviewer: String,
    /// Free-text reason recorded with the decision.
    pub rationale: String,
}

impl ReviewVerdict {
    /// Convenience constructor for an approving verdict.
    pub fn approve(reviewer: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Approved,
            reviewer: reviewer.into(),
            rationale: rationale.into(),
        }
    }

    /// Convenience constructor for a rejecting verdict.
    pub fn reject(reviewer: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Rejected,
            reviewer: reviewer.into(),
            rationale: rationale.into(),
        }
    }
}

/// An immutable, recorded approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Subtask the decision applies to.
    pub subtask_id: Uuid,
    /// Who decided.
    pub reviewer: String,
    /// Approve or reject.
    pub decision: ApprovalDecision,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
    /// Reason given by the reviewer.
    pub rationale: String,
}

impl ApprovalRecord {
    /// Stamp a verdict for a subtask with the current time.
    pub fn from_verdict(subtask_id: Uuid, verdict: ReviewVerdict) -> Self {
        Self {
            subtask_id,
            reviewer: verdict.reviewer,
            decision: verdict.decision,
            timestamp: Utc::now(),
            rationale: verdict.rationale,
        }
    }

    /// Whether this record approves the subtask.
    pub fn is_approved(&self) -> bool {
        self.decision == ApprovalDecision::Approved
    }
}

/// Channel through which approval requests are pushed to reviewers.
/// Implementations can be CLI prompts, chat bots, ticketing hooks, etc.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Deliver `request` to a reviewer and wait for the verdict.
    async fn request_approval(&self, request: ApprovalRequest) -> WardenResult<ReviewVerdict>;
}
