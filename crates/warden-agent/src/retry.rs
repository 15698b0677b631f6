use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use warden_core::WardenError;

/// Bounded retry behaviour for subtask execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of agent invocations per subtask.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter_ratio: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Like [`RetryPolicy::delay_for`] with a caller-supplied RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = compute_backoff(self, attempt);
        let spread = (base as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if spread == 0 { 0 } else { rng.gen_range(0..=spread) };
        Duration::from_millis(base.saturating_add(jitter).min(self.backoff_max_ms.max(base)))
    }
}

/// Whether an error is transient and worth another attempt.
///
/// Only transport-level failures qualify. Validation, compliance and circuit
/// errors have their own handling paths.
pub fn is_retryable(err: &WardenError) -> bool {
    matches!(err, WardenError::TransientExecution(_))
}

/// Exponential backoff for a given attempt, capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.0,
        };

        assert_eq!(compute_backoff(&policy, 0), 500);
        assert_eq!(compute_backoff(&policy, 1), 1000);
        assert_eq!(compute_backoff(&policy, 2), 2000);
        assert_eq!(compute_backoff(&policy, 5), 16000);
        assert_eq!(compute_backoff(&policy, 6), 30_000);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.25,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = policy.delay_with(1, &mut rng).as_millis() as u64;
            assert!((2000..=2500).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
        assert_eq!(policy.max_attempts, 4);
    }

    #[test]
    fn is_retryable_classification() {
        assert!(is_retryable(&WardenError::TransientExecution(
            "503 Service Unavailable".into()
        )));
        assert!(!is_retryable(&WardenError::Execution("bad input".into())));
        assert!(!is_retryable(&WardenError::ComplianceViolation("pii".into())));
        assert!(!is_retryable(&WardenError::CircuitOpen {
            agent: "a".into(),
            retry_in_ms: 0
        }));
    }
}
