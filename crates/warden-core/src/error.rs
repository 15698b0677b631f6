use thiserror::Error;

/// A convenience `Result` alias using [`WardenError`].
pub type WardenResult<T> = Result<T, WardenError>;

/// Top-level error type for the Warden engine.
///
/// The first six variants mirror the failure taxonomy the orchestrator acts on;
/// the rest are plumbing errors from configuration, persistence and I/O.
#[derive(Error, Debug)]
pub enum WardenError {
    /// A job was rejected at submission time and never entered the graph.
    #[error("Malformed job: {0}")]
    MalformedJob(String),

    /// Timeout or network-like failure from an agent call. Retried with backoff.
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// A permanent failure reported by an agent. Not retried.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The validator rejected a result on its fuzzy score.
    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    /// The agent's circuit breaker is open; the agent was not invoked.
    #[error("Circuit open for agent '{agent}' (retry in {retry_in_ms}ms)")]
    CircuitOpen {
        /// Agent whose breaker rejected the call.
        agent: String,
        /// Time left until the breaker admits a trial call.
        retry_in_ms: u64,
    },

    /// A deterministic validator rule was hit. Always fails closed.
    #[error("Compliance violation: {0}")]
    ComplianceViolation(String),

    /// Approval gate misuse: unknown subtask, duplicate decision, withdrawn request.
    #[error("Approval error: {0}")]
    Approval(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The owning job was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The owning job ran past its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Audit log corruption, chain breaks or ordering violations.
    #[error("Audit error: {0}")]
    Audit(String),

    /// Orchestrator-level failures (unknown job, unsatisfiable graph, ...).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Stable snake_case name of the variant, used in audit payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::MalformedJob(_) => "malformed_job",
            WardenError::TransientExecution(_) => "transient_execution",
            WardenError::Execution(_) => "execution",
            WardenError::ValidationFailure(_) => "validation_failure",
            WardenError::CircuitOpen { .. } => "circuit_open",
            WardenError::ComplianceViolation(_) => "compliance_violation",
            WardenError::Approval(_) => "approval",
            WardenError::Config(_) => "config",
            WardenError::Cancelled(_) => "cancelled",
            WardenError::DeadlineExceeded(_) => "deadline_exceeded",
            WardenError::Audit(_) => "audit",
            WardenError::Orchestrator(_) => "orchestrator",
            WardenError::Json(_) => "json",
            WardenError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_display() {
        let err = WardenError::CircuitOpen {
            agent: "summarizer-1".into(),
            retry_in_ms: 1500,
        };
        let msg = err.to_string();
        assert!(msg.contains("summarizer-1"));
        assert!(msg.contains("1500ms"));
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WardenError = io.into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("gone"));
    }
}
