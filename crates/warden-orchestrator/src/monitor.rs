use crate::policy::DriftResponse;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Scope name for statistics across all agents.
pub const GLOBAL_SCOPE: &str = "*";

/// Drift detection settings, loaded from the `[drift]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Number of most recent scores in the rolling window.
    pub window: usize,
    /// Alert when the rolling mean falls more than this below baseline.
    pub delta: f64,
    /// Alert when the rolling variance exceeds this.
    pub variance_ceiling: f64,
    /// What the orchestrator does about a drifting agent.
    pub response: DriftResponse,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window: 20,
            delta: 0.15,
            variance_ceiling: 0.05,
            response: DriftResponse::Escalate,
        }
    }
}

/// Rolling statistics for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyMetric {
    /// Agent id or `*` for the global scope.
    pub scope: String,
    /// Scores recorded since the scope was created.
    pub samples: u64,
    /// Mean of the current window.
    pub mean: f64,
    /// Population variance of the current window.
    pub variance: f64,
    /// Mean of the first full window; `None` while warming up.
    pub baseline: Option<f64>,
    /// Whether an alert is outstanding for the scope.
    pub drifting: bool,
}

/// Why a scope is considered drifting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftReason {
    /// Rolling mean fell more than `delta` below the baseline.
    MeanDrop {
        /// Mean of the first full window.
        baseline: f64,
        /// Current rolling mean.
        mean: f64,
        /// Allowed drop.
        delta: f64,
    },
    /// Rolling variance exceeded the ceiling.
    VarianceCeiling {
        /// Current rolling variance.
        variance: f64,
        /// Configured ceiling.
        ceiling: f64,
    },
}

impl std::fmt::Display for DriftReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriftReason::MeanDrop {
                baseline,
                mean,
                delta,
            } => write!(
                f,
                "rolling mean {mean:.3} fell more than {delta:.3} below baseline {baseline:.3}"
            ),
            DriftReason::VarianceCeiling { variance, ceiling } => {
                write!(f, "rolling variance {variance:.4} exceeds ceiling {ceiling:.4}")
            }
        }
    }
}

/// Raised once when a scope starts drifting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    /// Scope that started drifting.
    pub scope: String,
    /// Which check fired.
    pub reason: DriftReason,
    /// Statistics at the moment of the alert.
    pub metric: ConsistencyMetric,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

/// A drift state change produced by [`ConsistencyMonitor::record`].
#[derive(Debug, Clone)]
pub enum DriftSignal {
    /// A scope started drifting.
    Raised(DriftAlert),
    /// A drifting scope is back within bounds.
    Cleared {
        /// Scope that recovered.
        scope: String,
        /// Statistics at recovery.
        metric: ConsistencyMetric,
    },
}

/// Answer to [`ConsistencyMonitor::get_drift`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriftStatus {
    /// No scores recorded for the scope.
    Unknown,
    /// Window not yet full, or baseline just established.
    Warming {
        /// Scores recorded so far.
        samples: u64,
        /// Window size.
        needed: usize,
    },
    /// Window full and within bounds.
    Stable(ConsistencyMetric),
    /// An alert is outstanding.
    Drifting(ConsistencyMetric),
}

struct RollingStats {
    window: VecDeque<f64>,
    samples: u64,
    baseline: Option<f64>,
    drifting: bool,
}

impl RollingStats {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            samples: 0,
            baseline: None,
            drifting: false,
        }
    }

    fn mean_and_variance(&self) -> (f64, f64) {
        if self.window.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, variance)
    }

    fn metric(&self, scope: &str) -> ConsistencyMetric {
        let (mean, variance) = self.mean_and_variance();
        ConsistencyMetric {
            scope: scope.to_string(),
            samples: self.samples,
            mean,
            variance,
            baseline: self.baseline,
            drifting: self.drifting,
        }
    }

    /// Add a score; returns a signal only when the drift state flips.
    fn push(&mut self, scope: &str, score: f64, config: &DriftConfig) -> Option<DriftSignal> {
        self.window.push_back(score.clamp(0.0, 1.0));
        while self.window.len() > config.window {
            self.window.pop_front();
        }
        self.samples += 1;
        if self.window.len() < config.window {
            return None;
        }

        let (mean, variance) = self.mean_and_variance();
        let Some(baseline) = self.baseline else {
            self.baseline = Some(mean);
            return None;
        };

        let reason = if mean < baseline - config.delta {
            Some(DriftReason::MeanDrop {
                baseline,
                mean,
                delta: config.delta,
            })
        } else if variance > config.variance_ceiling {
            Some(DriftReason::VarianceCeiling {
                variance,
                ceiling: config.variance_ceiling,
            })
        } else {
            None
        };

        match (self.drifting, reason) {
            (false, Some(reason)) => {
                self.drifting = true;
                Some(DriftSignal::Raised(DriftAlert {
                    scope: scope.to_string(),
                    reason,
                    metric: self.metric(scope),
                    raised_at: Utc::now(),
                }))
            }
            (true, None) => {
                self.drifting = false;
                Some(DriftSignal::Cleared {
                    scope: scope.to_string(),
                    metric: self.metric(scope),
                })
            }
            _ => None,
        }
    }
}

/// Tracks validator scores per agent and across all agents.
///
/// Each scope keeps a fixed window of recent scores. The first full window
/// fixes the baseline. An alert is raised when the scope starts drifting and
/// a clear signal when it recovers, never once per sample.
pub struct ConsistencyMonitor {
    config: DriftConfig,
    scopes: RwLock<HashMap<String, Arc<Mutex<RollingStats>>>>,
}

impl ConsistencyMonitor {
    /// A monitor with no scopes yet.
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Window and thresholds in use.
    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Record a validator score for `agent_id` and the global scope.
    pub fn record(&self, agent_id: &str, score: f64) -> Vec<DriftSignal> {
        let mut signals = Vec::new();
        for scope in [agent_id, GLOBAL_SCOPE] {
            let stats = self.scope(scope);
            let signal = stats.lock().push(scope, score, &self.config);
            if let Some(signal) = signal {
                if let DriftSignal::Raised(alert) = &signal {
                    warn!(scope = %alert.scope, reason = %alert.reason, "Consistency drift detected");
                }
                signals.push(signal);
            }
        }
        signals
    }

    /// Drift status of one scope.
    pub fn get_drift(&self, scope: &str) -> DriftStatus {
        let Some(stats) = self.scopes.read().get(scope).cloned() else {
            return DriftStatus::Unknown;
        };
        let stats = stats.lock();
        if stats.baseline.is_none() {
            return DriftStatus::Warming {
                samples: stats.samples,
                needed: self.config.window,
            };
        }
        let metric = stats.metric(scope);
        if stats.drifting {
            DriftStatus::Drifting(metric)
        } else {
            DriftStatus::Stable(metric)
        }
    }

    /// Metrics for every scope, keyed by scope name.
    pub fn snapshot(&self) -> BTreeMap<String, ConsistencyMetric> {
        self.scopes
            .read()
            .iter()
            .map(|(scope, stats)| (scope.clone(), stats.lock().metric(scope)))
            .collect()
    }

    /// Serialize the current metrics as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "window": self.config.window,
            "delta": self.config.delta,
            "variance_ceiling": self.config.variance_ceiling,
            "scopes": self.snapshot(),
        })
    }

    fn scope(&self, scope: &str) -> Arc<Mutex<RollingStats>> {
        if let Some(stats) = self.scopes.read().get(scope) {
            return stats.clone();
        }
        self.scopes
            .write()
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RollingStats::new(self.config.window))))
            .clone()
    }
}
