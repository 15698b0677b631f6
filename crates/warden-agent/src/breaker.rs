use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use warden_core::{WardenError, WardenResult};

/// State of a per-agent circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Fail fast without invoking the agent.
    Open,
    /// A single trial call decides between closing and reopening.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for [`CircuitBreaker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures (inside the window) that open the circuit.
    pub failure_threshold: u32,
    /// Length of the window a failure streak must fit in.
    pub failure_window_ms: u64,
    /// Time after the last failure before a trial call is admitted.
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// A state change, returned so callers can audit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
    /// Short, fixed description of what caused it.
    pub reason: &'static str,
}

/// Result of [`CircuitBreaker::call`].
#[derive(Debug)]
pub struct BreakerOutcome<T> {
    /// What the wrapped call returned, or the rejection if it never ran.
    pub result: WardenResult<T>,
    /// Whether the wrapped call actually ran.
    pub invoked: bool,
    /// Transitions caused by this call, in order.
    pub transitions: Vec<Transition>,
}

/// Admission granted by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// This call is the single HALF_OPEN trial.
    pub trial: bool,
    /// Set when admission moved OPEN to HALF_OPEN.
    pub transition: Option<Transition>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-agent fault isolation.
///
/// CLOSED opens after `failure_threshold` consecutive failures within
/// `failure_window_ms`. OPEN rejects calls until `recovery_timeout_ms` has
/// passed since the last failure, then admits exactly one HALF_OPEN trial.
/// The trial's success closes the circuit, its failure reopens it and
/// restarts the recovery timer.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// A CLOSED breaker labelled `name` in logs.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Label used in logs, usually the agent id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An OPEN circuit whose timeout has elapsed still reports
    /// OPEN until the next admission moves it to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted in the current streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask permission to invoke the agent.
    pub fn admit(&self) -> WardenResult<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                trial: false,
                transition: None,
            }),
            CircuitState::Open => {
                let recovery = Duration::from_millis(self.config.recovery_timeout_ms);
                let elapsed = inner
                    .last_failure
                    .map_or(recovery, |at| Instant::now().saturating_duration_since(at));
                if elapsed >= recovery {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(agent = %self.name, "Circuit half-open: admitting trial call");
                    Ok(Admission {
                        trial: true,
                        transition: Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            reason: "recovery timeout elapsed",
                        }),
                    })
                } else {
                    Err(WardenError::CircuitOpen {
                        agent: self.name.clone(),
                        retry_in_ms: (recovery - elapsed).as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(WardenError::CircuitOpen {
                        agent: self.name.clone(),
                        retry_in_ms: 0,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission {
                        trial: true,
                        transition: None,
                    })
                }
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.streak_started = None;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.trial_in_flight = false;
                info!(agent = %self.name, "Circuit closed after successful trial");
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                    reason: "trial call succeeded",
                })
            }
            _ => None,
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                let window = Duration::from_millis(self.config.failure_window_ms);
                let in_window = inner
                    .streak_started
                    .is_some_and(|start| now.saturating_duration_since(start) <= window);
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.streak_started = Some(now);
                    inner.consecutive_failures = 1;
                }

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        agent = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        reason: "failure threshold reached",
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(agent = %self.name, "Trial call failed, circuit reopened");
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                    reason: "trial call failed",
                })
            }
            // Late failure from a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    /// Give back an unused HALF_OPEN trial (the call was cancelled).
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Put the agent on probation: the next call becomes a trial.
    pub fn force_half_open(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            return None;
        }
        let from = inner.state;
        inner.state = CircuitState::HalfOpen;
        inner.trial_in_flight = false;
        Some(Transition {
            from,
            to: CircuitState::HalfOpen,
            reason: "probation",
        })
    }

    /// Run `call` through the breaker.
    ///
    /// When the circuit rejects, `call` is never invoked and the result is
    /// [`WardenError::CircuitOpen`]. Transient and execution errors count as
    /// failures; cancellation and other errors leave the counters untouched.
    pub async fn call<T, F, Fut>(&self, call: F) -> BreakerOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let admission = match self.admit() {
            Ok(a) => a,
            Err(e) => {
                return BreakerOutcome {
                    result: Err(e),
                    invoked: false,
                    transitions: Vec::new(),
                }
            }
        };
        let mut transitions: Vec<Transition> = admission.transition.into_iter().collect();

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission.trial,
        };
        let result = call().await;
        guard.armed = false;

        let transition = match &result {
            Ok(_) => self.record_success(),
            Err(WardenError::TransientExecution(_) | WardenError::Execution(_)) => {
                self.record_failure()
            }
            Err(_) => {
                if admission.trial {
                    self.abandon_trial();
                }
                None
            }
        };
        transitions.extend(transition);

        BreakerOutcome {
            result,
            invoked: true,
            transitions,
        }
    }
}

/// Releases an outstanding trial if the call future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}
