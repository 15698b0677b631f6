use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;
use warden_core::RiskTier;
use warden_security::AuditEntry;

/// Lifecycle of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet scheduled.
    Pending,
    /// Subtasks are being dispatched.
    Running,
    /// Waiting on at least one reviewer.
    AwaitingApproval,
    /// Every subtask is done.
    Completed,
    /// A subtask failed or was rejected, or the job was cancelled.
    Failed {
        /// What stopped the job.
        reason: String,
    },
}

impl JobStatus {
    /// `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::AwaitingApproval => write!(f, "awaiting_approval"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// Lifecycle of a subtask. `Done`, `Rejected` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Waiting for dependencies or a worker.
    Queued,
    /// Handed to an agent.
    Dispatched,
    /// Passed validation.
    Validated,
    /// Held at the approval gate.
    AwaitingApproval,
    /// A reviewer approved the result.
    Approved,
    /// Rejected by validation or a reviewer.
    Rejected {
        /// Violation or reviewer rationale.
        reason: String,
    },
    /// Execution failed or the job halted.
    Failed {
        /// Last error or halt reason.
        reason: String,
    },
    /// Result accepted.
    Done,
}

impl SubtaskStatus {
    /// `Done`, `Rejected` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Done | SubtaskStatus::Rejected { .. } | SubtaskStatus::Failed { .. }
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Queued => write!(f, "queued"),
            SubtaskStatus::Dispatched => write!(f, "dispatched"),
            SubtaskStatus::Validated => write!(f, "validated"),
            SubtaskStatus::AwaitingApproval => write!(f, "awaiting_approval"),
            SubtaskStatus::Approved => write!(f, "approved"),
            SubtaskStatus::Rejected { reason } => write!(f, "rejected ({reason})"),
            SubtaskStatus::Failed { reason } => write!(f, "failed ({reason})"),
            SubtaskStatus::Done => write!(f, "done"),
        }
    }
}

/// Risk-relevant metadata declared with a job or a single stage task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactProfile {
    /// Monetary or otherwise quantified impact of the real-world action.
    pub magnitude: f64,
    /// Whether the action can be undone.
    pub reversible: bool,
}

impl Default for ImpactProfile {
    fn default() -> Self {
        Self {
            magnitude: 0.0,
            reversible: true,
        }
    }
}

/// One declared unit of work inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTask {
    /// Capability tag used to pick an agent.
    pub capability: String,
    /// Unique name within the job; defaults to the capability.
    #[serde(default)]
    pub name: Option<String>,
    /// Task input. Null means the job payload is used.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Names of tasks that must be done first, in addition to the previous stage.
    #[serde(default)]
    pub after: Vec<String>,
    /// Overrides the job-level impact for this task.
    #[serde(default)]
    pub impact: Option<ImpactProfile>,
}

impl StageTask {
    /// A task for `capability` named after it.
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            name: None,
            input: serde_json::Value::Null,
            after: Vec::new(),
            impact: None,
        }
    }

    /// Give the task an explicit name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the task input.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Depend on another task by name.
    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.after.push(name.into());
        self
    }

    /// Override the job-level impact.
    pub fn with_impact(mut self, impact: ImpactProfile) -> Self {
        self.impact = Some(impact);
        self
    }
}

/// Tasks in one stage run in parallel; stages run in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    /// Tasks run in parallel within the stage.
    pub tasks: Vec<StageTask>,
}

/// A job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Human-readable job name.
    #[serde(default)]
    pub name: String,
    /// Input shared by every task.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Stages, run in order.
    pub stages: Vec<Stage>,
    /// Impact applied to tasks without their own.
    #[serde(default)]
    pub impact: ImpactProfile,
    /// Overall deadline; overrides the configured default.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl JobRequest {
    /// An empty job named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append a stage of parallel tasks.
    pub fn stage(mut self, tasks: Vec<StageTask>) -> Self {
        self.stages.push(Stage { tasks });
        self
    }

    /// Append a stage built from bare capability tags.
    pub fn stage_of(self, capabilities: &[&str]) -> Self {
        self.stage(capabilities.iter().map(|c| StageTask::new(*c)).collect())
    }

    /// Set the shared payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the job-level impact.
    pub fn with_impact(mut self, impact: ImpactProfile) -> Self {
        self.impact = impact;
        self
    }

    /// Set a deadline for the whole job.
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

/// A submitted job, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: Uuid,
    /// Name from the request.
    pub name: String,
    /// Shared payload.
    pub payload: serde_json::Value,
    /// Job-level impact.
    pub impact: ImpactProfile,
    /// Current status.
    pub status: JobStatus,
    /// Deadline in milliseconds from submission.
    pub deadline_ms: Option<u64>,
    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A pending job with a fresh id.
    pub fn from_request(request: &JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            payload: request.payload.clone(),
            impact: request.impact.clone(),
            status: JobStatus::Pending,
            deadline_ms: request.deadline_ms,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// What an agent produced for a subtask, with its validation score and tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Subtask that produced the result.
    pub subtask_id: Uuid,
    /// Agent that produced it.
    pub agent_id: String,
    /// Raw agent output.
    pub output: serde_json::Value,
    /// Validator score in `[0, 1]`.
    pub score: f64,
    /// Tier assigned by the classifier.
    pub tier: RiskTier,
    /// When the result was received.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// A fresh result; score and tier are filled in by validation and classification.
    pub fn new(subtask_id: Uuid, agent_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            subtask_id,
            agent_id: agent_id.into(),
            output,
            score: 0.0,
            tier: RiskTier::Low,
            timestamp: Utc::now(),
        }
    }

    /// The output as text: strings verbatim, everything else as JSON.
    pub fn output_text(&self) -> String {
        match &self.output {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A node of a job's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Subtask id.
    pub id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Unique name within the job.
    pub name: String,
    /// Capability tag.
    pub capability: String,
    /// Input handed to the agent.
    pub input: serde_json::Value,
    /// Subtasks that must be done first.
    pub dependencies: Vec<Uuid>,
    /// Effective impact.
    pub impact: ImpactProfile,
    /// Current status.
    pub status: SubtaskStatus,
    /// Agent that last ran it.
    pub assigned_agent: Option<String>,
    /// Latest result, if any.
    pub result: Option<ExecutionResult>,
    /// Agent calls made so far.
    pub attempts: u32,
    /// When the subtask was created.
    pub created_at: DateTime<Utc>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// A queued subtask with no dependencies.
    pub fn new(job_id: Uuid, name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            name: name.into(),
            capability: capability.into(),
            input: serde_json::Value::Null,
            dependencies: Vec::new(),
            impact: ImpactProfile::default(),
            status: SubtaskStatus::Queued,
            assigned_agent: None,
            result: None,
            attempts: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Set the dependency ids.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Queued and every dependency is done.
    pub fn is_ready(&self, done: &HashSet<Uuid>) -> bool {
        self.status == SubtaskStatus::Queued
            && self.dependencies.iter().all(|dep| done.contains(dep))
    }
}

/// Returned by [`crate::Orchestrator::submit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    /// Id of the accepted job.
    pub job_id: Uuid,
    /// Status at submission.
    pub status: JobStatus,
}

/// Per-subtask line of a [`JobReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskReport {
    /// Subtask id.
    pub id: Uuid,
    /// Subtask name.
    pub name: String,
    /// Capability tag.
    pub capability: String,
    /// Final status.
    pub status: SubtaskStatus,
    /// Agent that last ran it.
    pub agent: Option<String>,
    /// Agent calls made.
    pub attempts: u32,
    /// Validator score of the last result.
    pub score: Option<f64>,
    /// Risk tier of the last result.
    pub tier: Option<RiskTier>,
    /// Last agent output.
    pub output: Option<serde_json::Value>,
}

impl From<&Subtask> for SubtaskReport {
    fn from(s: &Subtask) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            capability: s.capability.clone(),
            status: s.status.clone(),
            agent: s.assigned_agent.clone(),
            attempts: s.attempts,
            score: s.result.as_ref().map(|r| r.score),
            tier: s.result.as_ref().map(|r| r.tier),
            output: s.result.as_ref().map(|r| r.output.clone()),
        }
    }
}

/// Final account of a job, with its audit entries as the explanation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Job id.
    pub job_id: Uuid,
    /// Job name.
    pub name: String,
    /// Final status.
    pub status: JobStatus,
    /// One-line outcome.
    pub summary: String,
    /// Per-subtask outcomes, in graph order.
    pub subtasks: Vec<SubtaskReport>,
    /// Wall time from submission to the terminal status.
    pub duration_ms: u64,
    /// Audit entries of the job and its subtasks.
    pub audit_trail: Vec<AuditEntry>,
}

impl JobReport {
    /// Subtask line by name.
    pub fn subtask(&self, name: &str) -> Option<&SubtaskReport> {
        self.subtasks.iter().find(|s| s.name == name)
    }
}
