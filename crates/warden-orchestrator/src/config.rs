use crate::gate::ApprovalConfig;
use crate::monitor::DriftConfig;
use crate::policy::DriftResponse;
use crate::risk::RiskPolicy;
use crate::validator::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_agent::{BreakerConfig, RetryPolicy};
use warden_core::{RiskTier, WardenError, WardenResult};
use warden_security::ContentFilter;

/// Engine configuration. Every section is optional in the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// `[orchestrator]` scheduling limits.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// `[retry]` backoff for transient agent failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// `[breaker]` settings shared by every agent's circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// `[validation]` rules and scoring.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// `[risk]` classification bands.
    #[serde(default)]
    pub risk: RiskPolicy,
    /// `[approval]` threshold and timeouts.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// `[drift]` monitor window and response.
    #[serde(default)]
    pub drift: DriftConfig,
    /// `[audit]` persistence.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Scheduling limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently executing subtasks across all jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-call agent timeout when the capability has no override.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-capability call timeouts, overriding `default_timeout_ms`.
    #[serde(default)]
    pub capability_timeouts_ms: HashMap<String, u64>,
    /// Job deadline applied when a job does not declare its own.
    #[serde(default)]
    pub job_deadline_ms: Option<u64>,
}

fn default_max_workers() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_timeout_ms: default_timeout_ms(),
            capability_timeouts_ms: HashMap::new(),
            job_deadline_ms: None,
        }
    }
}

/// Where the audit log is persisted. In memory only when `dir` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for the JSON Lines log file.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl WardenConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(text: &str) -> WardenResult<Self> {
        let config: WardenConfig =
            toml::from_str(text).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Per-call timeout for `capability`.
    pub fn timeout_for(&self, capability: &str) -> Duration {
        let ms = self
            .orchestrator
            .capability_timeouts_ms
            .get(capability)
            .copied()
            .unwrap_or(self.orchestrator.default_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> WardenResult<()> {
        let fail = |msg: String| Err(WardenError::Config(msg));

        if self.orchestrator.max_workers == 0 {
            return fail("orchestrator.max_workers must be at least 1".into());
        }
        if self.orchestrator.default_timeout_ms == 0 {
            return fail("orchestrator.default_timeout_ms must be positive".into());
        }
        if let Some((cap, _)) = self
            .orchestrator
            .capability_timeouts_ms
            .iter()
            .find(|(_, ms)| **ms == 0)
        {
            return fail(format!("timeout for capability '{cap}' must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return fail("retry.jitter_ratio must be within [0, 1]".into());
        }
        if self.breaker.failure_threshold == 0 {
            return fail("breaker.failure_threshold must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.validation.pass_threshold) {
            return fail("validation.pass_threshold must be within [0, 1]".into());
        }
        ContentFilter::new(
            &self.validation.forbidden_patterns,
            self.validation.max_output_bytes,
        )?;
        let r = &self.risk;
        if ![r.medium_magnitude, r.high_magnitude, r.critical_magnitude]
            .iter()
            .all(|m| m.is_finite())
        {
            return fail("risk magnitudes must be finite".into());
        }
        if !(r.medium_magnitude <= r.high_magnitude && r.high_magnitude <= r.critical_magnitude) {
            return fail(
                "risk magnitudes must satisfy medium <= high <= critical".into(),
            );
        }
        if self.drift.window < 2 {
            return fail("drift.window must be at least 2".into());
        }
        if self.drift.delta <= 0.0 || self.drift.variance_ceiling <= 0.0 {
            return fail("drift.delta and drift.variance_ceiling must be positive".into());
        }
        if self.drift.response == (DriftResponse::ReduceConcurrency { limit: 0 }) {
            return fail("drift.response limit must be at least 1".into());
        }
        if self.approval.threshold > RiskTier::High {
            return fail(format!(
                "approval.threshold '{}' would let high tier results through unreviewed",
                self.approval.threshold
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for t in &self.approval.timeouts {
            if !seen.insert(t.tier) {
                return fail(format!("approval timeout for tier '{}' given twice", t.tier));
            }
            if t.after_ms == 0 {
                return fail(format!("approval timeout for tier '{}' must be positive", t.tier));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gate::TimeoutAction;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config.orchestrator.max_workers, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.approval.threshold, RiskTier::High);
        assert_eq!(config.drift.window, 20);
        assert_eq!(config.drift.response, DriftResponse::Escalate);
        assert!(config.audit.dir.is_none());
        assert_eq!(config.timeout_for("anything"), Duration::from_secs(30));
    }

    #[test]
    fn test_full_document() {
        let text = r#"
            [orchestrator]
            max_workers = 2
            capability_timeouts_ms = { summarize = 1500 }
            job_deadline_ms = 60000

            [retry]
            max_attempts = 4
            backoff_base_ms = 50

            [breaker]
            failure_threshold = 3
            recovery_timeout_ms = 5000

            [validation]
            forbidden_patterns = ["password"]
            required_fields = { merge = ["title"] }

            [risk]
            capability_floors = { transfer = "high" }

            [approval]
            threshold = "medium"
            override_rejections = true
            timeouts = [{ tier = "critical", after_ms = 90000, action = "auto_reject" }]

            [drift]
            window = 10
            response = { kind = "probation" }

            [audit]
            dir = "/var/lib/warden"
        "#;
        let config = WardenConfig::from_toml(text).unwrap();
        assert_eq!(config.orchestrator.max_workers, 2);
        assert_eq!(config.timeout_for("summarize"), Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff_max_ms, 10_000);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.failure_window_ms, 60_000);
        assert_eq!(config.validation.required_fields["merge"], vec!["title"]);
        assert_eq!(config.risk.capability_floors["transfer"], RiskTier::High);
        assert_eq!(config.approval.threshold, RiskTier::Medium);
        assert!(config.approval.override_rejections);
        assert_eq!(
            config.approval.timeout_for(RiskTier::Critical).unwrap().action,
            TimeoutAction::AutoReject
        );
        assert_eq!(config.drift.response, DriftResponse::Probation);
        assert_eq!(config.audit.dir.as_deref(), Some(Path::new("/var/lib/warden")));
    }

    #[test]
    fn test_rejects_bad_values() {
        for text in [
            "[orchestrator]\nmax_workers = 0",
            "[retry]\nmax_attempts = 0",
            "[validation]\npass_threshold = 1.5",
            "[validation]\nforbidden_patterns = [\"(\"]",
            "[risk]\nhigh_magnitude = 10.0\nmedium_magnitude = 100.0",
            "[drift]\nwindow = 1",
            "[risk]\ncritical_magnitude = inf",
            "[approval]\ntimeouts = [{ tier = \"high\", after_ms = 0, action = \"auto_approve\" }]",
        ] {
            let err = WardenConfig::from_toml(text).unwrap_err();
            assert_eq!(err.kind(), "config", "accepted: {text}");
        }
    }

    #[test]
    fn test_threshold_above_high_rejected() {
        let err = WardenConfig::from_toml("[approval]\nthreshold = \"critical\"").unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("approval.threshold"));

        for tier in ["low", "medium", "high"] {
            let text = format!("[approval]\nthreshold = \"{tier}\"");
            assert!(WardenConfig::from_toml(&text).is_ok(), "rejected: {tier}");
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = WardenConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
