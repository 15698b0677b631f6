use crate::monitor::{DriftAlert, GLOBAL_SCOPE};
use serde::{Deserialize, Serialize};

/// Configured reaction to an agent that starts drifting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftResponse {
    /// Record the alert only.
    Ignore,
    /// Lower the agent's concurrency limit until it recovers.
    ReduceConcurrency {
        /// Concurrency cap applied to the agent.
        limit: usize,
    },
    /// Move the agent's breaker to HALF_OPEN so its next call is a trial.
    Probation,
    /// Route every result of the agent through the approval gate until it recovers.
    #[default]
    Escalate,
}

/// What the orchestrator should do after a drift signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DriftAction {
    /// Leave the agent alone.
    None,
    /// Cap the agent's in-flight subtasks at `limit`.
    ReduceConcurrency {
        /// Drifting agent.
        agent_id: String,
        /// New concurrency cap.
        limit: usize,
    },
    /// Force the agent's breaker into a trial call.
    Probation {
        /// Drifting agent.
        agent_id: String,
    },
    /// Send the agent's results to the approval gate.
    Escalate {
        /// Drifting agent.
        agent_id: String,
    },
    /// Undo whatever was applied to the agent.
    Restore {
        /// Recovered agent.
        agent_id: String,
    },
}

/// Decides how drift alerts are acted on.
pub trait DriftPolicy: Send + Sync {
    /// Action for a newly raised alert.
    fn on_drift(&self, alert: &DriftAlert) -> DriftAction;

    /// Action for a cleared scope. Nothing by default.
    fn on_clear(&self, scope: &str) -> DriftAction {
        let _ = scope;
        DriftAction::None
    }
}

/// [`DriftPolicy`] driven by a [`DriftResponse`].
///
/// The global scope is never acted on; it has no agent to adjust.
pub struct ConfiguredDriftPolicy {
    response: DriftResponse,
}

impl ConfiguredDriftPolicy {
    /// A policy applying `response` to every agent scope.
    pub fn new(response: DriftResponse) -> Self {
        Self { response }
    }
}

impl DriftPolicy for ConfiguredDriftPolicy {
    fn on_drift(&self, alert: &DriftAlert) -> DriftAction {
        if alert.scope == GLOBAL_SCOPE {
            return DriftAction::None;
        }
        let agent_id = alert.scope.clone();
        match &self.response {
            DriftResponse::Ignore => DriftAction::None,
            DriftResponse::ReduceConcurrency { limit } => DriftAction::ReduceConcurrency {
                agent_id,
                limit: *limit,
            },
            DriftResponse::Probation => DriftAction::Probation { agent_id },
            DriftResponse::Escalate => DriftAction::Escalate { agent_id },
        }
    }

    fn on_clear(&self, scope: &str) -> DriftAction {
        if scope == GLOBAL_SCOPE || self.response == DriftResponse::Ignore {
            return DriftAction::None;
        }
        DriftAction::Restore {
            agent_id: scope.to_string(),
        }
    }
}
