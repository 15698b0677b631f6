use crate::types::{ExecutionResult, ImpactProfile, Subtask};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use warden_core::RiskTier;

/// Classification thresholds, loaded from the `[risk]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Minimum tier per capability.
    pub capability_floors: HashMap<String, RiskTier>,
    /// Impact magnitude at or above which a result is at least Medium.
    pub medium_magnitude: f64,
    /// Magnitude at or above which a result is at least High.
    pub high_magnitude: f64,
    /// Magnitude at or above which a result is Critical.
    pub critical_magnitude: f64,
    /// Raise irreversible actions by one tier.
    pub irreversible_escalation: bool,
    /// Validator scores below this raise the tier by one.
    pub low_score_threshold: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            capability_floors: HashMap::new(),
            medium_magnitude: 1_000.0,
            high_magnitude: 10_000.0,
            critical_magnitude: 100_000.0,
            irreversible_escalation: true,
            low_score_threshold: 0.6,
        }
    }
}

/// Pure function from (subtask, result) to a [`RiskTier`].
///
/// The tier is the highest of the capability floor and the magnitude band,
/// then raised one step for an irreversible action and one step for a low
/// validator score.
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    policy: RiskPolicy,
}

impl RiskClassifier {
    /// A classifier for `policy`.
    pub fn new(policy: RiskPolicy) -> Self {
        Self { policy }
    }

    /// Bands and floors in use.
    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Tier for a subtask's result.
    pub fn classify(&self, subtask: &Subtask, result: &ExecutionResult) -> RiskTier {
        self.classify_parts(&subtask.capability, &subtask.impact, result.score)
    }

    /// Classification from its raw inputs.
    pub fn classify_parts(&self, capability: &str, impact: &ImpactProfile, score: f64) -> RiskTier {
        let floor = self
            .policy
            .capability_floors
            .get(capability)
            .copied()
            .unwrap_or(RiskTier::Low);
        let mut tier = floor.max(self.magnitude_tier(impact.magnitude));

        if !impact.reversible && self.policy.irreversible_escalation {
            tier = tier.escalate();
        }
        if score < self.policy.low_score_threshold {
            tier = tier.escalate();
        }
        tier
    }

    /// Tier implied by impact magnitude alone. A magnitude that is not a
    /// finite number is treated as `Critical`.
    pub fn magnitude_tier(&self, magnitude: f64) -> RiskTier {
        if !magnitude.is_finite() {
            return RiskTier::Critical;
        }
        let m = magnitude.abs();
        if m >= self.policy.critical_magnitude {
            RiskTier::Critical
        } else if m >= self.policy.high_magnitude {
            RiskTier::High
        } else if m >= self.policy.medium_magnitude {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}
