use crate::config::WardenConfig;
use crate::decomposer::Decomposer;
use crate::gate::ApprovalGate;
use crate::graph::SubtaskGraph;
use crate::monitor::{ConsistencyMonitor, DriftSignal};
use crate::policy::{ConfiguredDriftPolicy, DriftAction, DriftPolicy};
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::risk::RiskClassifier;
use crate::types::{
    ExecutionResult, Job, JobReport, JobRequest, JobStatus, JobTicket, Subtask, SubtaskReport,
    SubtaskStatus,
};
use crate::validator::SupervisorValidator;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_agent::{is_retryable, SpecialistAgent, Transition};
use warden_core::{
    ApprovalChannel, ApprovalRecord, ApprovalRequest, ReviewVerdict, WardenError, WardenResult,
};
use warden_security::{preview, AuditEntry, AuditEvent, AuditFilter, AuditLog};

/// How a subtask's task ended, as seen by the job driver.
enum SubtaskOutcome {
    Done,
    /// Rejected or failed; fails the job with this reason.
    Settled(String),
    /// Stopped without a verdict (approval withdrawn).
    Abandoned,
}

/// Result of the execute/validate loop, before any review.
enum Verdict {
    Accept(ExecutionResult),
    Review {
        result: ExecutionResult,
        reason: String,
    },
    Settled(SubtaskOutcome),
}

/// Why a job stopped before every subtask was done.
enum Halt {
    Subtask(String),
    Stalled(String),
    Cancelled(String),
    Deadline,
}

impl Halt {
    fn job_reason(&self) -> String {
        match self {
            Halt::Subtask(r) | Halt::Stalled(r) => r.clone(),
            Halt::Cancelled(r) => format!("cancelled: {r}"),
            Halt::Deadline => "deadline exceeded".into(),
        }
    }

    fn subtask_reason(&self) -> String {
        match self {
            Halt::Subtask(_) | Halt::Stalled(_) => "cancelled: job failed".into(),
            Halt::Cancelled(_) => "cancelled".into(),
            Halt::Deadline => "deadline exceeded".into(),
        }
    }
}

struct JobCell {
    job: Job,
    /// Subtasks currently waiting on the approval gate.
    awaiting: usize,
}

struct JobRuntime {
    id: Uuid,
    cell: Mutex<JobCell>,
    graph: RwLock<SubtaskGraph>,
    cancel: watch::Sender<Option<String>>,
    status: watch::Sender<JobStatus>,
    started: Instant,
    deadline: Option<Duration>,
}

struct EngineState {
    config: WardenConfig,
    registry: AgentRegistry,
    audit: Arc<AuditLog>,
    validator: SupervisorValidator,
    classifier: RiskClassifier,
    gate: ApprovalGate,
    monitor: ConsistencyMonitor,
    drift_policy: Arc<dyn DriftPolicy>,
    workers: Semaphore,
    jobs: parking_lot::RwLock<HashMap<Uuid, Arc<JobRuntime>>>,
    /// Agents whose results always go to review while they drift.
    escalated: Mutex<HashSet<String>>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: WardenConfig,
    audit: Option<Arc<AuditLog>>,
    drift_policy: Option<Arc<dyn DriftPolicy>>,
    channel: Option<Arc<dyn ApprovalChannel>>,
}

impl OrchestratorBuilder {
    /// Use an existing audit log instead of the one described by the config.
    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the drift policy derived from `[drift].response`.
    pub fn drift_policy(mut self, policy: Arc<dyn DriftPolicy>) -> Self {
        self.drift_policy = Some(policy);
        self
    }

    /// Forward approval requests to a reviewer channel.
    pub fn approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Validate the config and assemble the engine. When the config names an
    /// audit directory this spawns the log writer, so call it inside a runtime.
    pub fn build(self) -> WardenResult<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let audit = self.audit.unwrap_or_else(|| match &config.audit.dir {
            Some(dir) => Arc::new(AuditLog::new(dir.clone())),
            None => Arc::new(AuditLog::in_memory()),
        });
        let gate = match self.channel {
            Some(channel) => ApprovalGate::with_channel(config.approval.clone(), audit.clone(), channel),
            None => ApprovalGate::new(config.approval.clone(), audit.clone()),
        };
        let drift_policy = self.drift_policy.unwrap_or_else(|| {
            Arc::new(ConfiguredDriftPolicy::new(config.drift.response.clone()))
        });

        let state = EngineState {
            registry: AgentRegistry::new(config.breaker.clone()),
            validator: SupervisorValidator::new(config.validation.clone())?,
            classifier: RiskClassifier::new(config.risk.clone()),
            monitor: ConsistencyMonitor::new(config.drift.clone()),
            workers: Semaphore::new(config.orchestrator.max_workers),
            jobs: parking_lot::RwLock::new(HashMap::new()),
            escalated: Mutex::new(HashSet::new()),
            drift_policy,
            gate,
            audit,
            config,
        };
        Ok(Orchestrator {
            state: Arc::new(state),
        })
    }
}

/// The governance engine.
///
/// Jobs are decomposed into a dependency graph and driven concurrently:
/// every ready subtask is dispatched to the least-loaded agent for its
/// capability, through that agent's circuit breaker, under the global worker
/// limit. Results are validated, classified and, at or above the approval
/// threshold, held for a reviewer. Every state change is written to the
/// audit log.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<EngineState>,
}

impl Orchestrator {
    /// Build an orchestrator straight from a config.
    pub fn new(config: WardenConfig) -> WardenResult<Self> {
        Self::builder(config).build()
    }

    /// Start building an orchestrator with custom audit, drift policy or approval channel.
    pub fn builder(config: WardenConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            audit: None,
            drift_policy: None,
            channel: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &WardenConfig {
        &self.state.config
    }

    /// Registered agents.
    pub fn registry(&self) -> &AgentRegistry {
        &self.state.registry
    }

    /// The shared audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.state.audit
    }

    /// Per-agent and global consistency statistics.
    pub fn monitor(&self) -> &ConsistencyMonitor {
        &self.state.monitor
    }

    /// The approval gate. Use it to decide pending requests.
    pub fn gate(&self) -> &ApprovalGate {
        &self.state.gate
    }

    /// Register an agent and audit it.
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn SpecialistAgent>,
    ) -> WardenResult<()> {
        let payload = serde_json::to_value(&descriptor)?;
        let id = descriptor.id.clone();
        self.state.registry.register(descriptor, agent)?;
        self.state
            .audit
            .append(id, None, AuditEvent::AgentRegistered, payload)?;
        Ok(())
    }

    /// Remove an agent. Its in-flight calls finish; nothing new is routed to it.
    pub fn deregister_agent(&self, id: &str) -> WardenResult<AgentDescriptor> {
        let removed = self
            .state
            .registry
            .deregister(id)
            .ok_or_else(|| WardenError::Orchestrator(format!("unknown agent '{id}'")))?;
        self.state.audit.append(
            id,
            None,
            AuditEvent::AgentDeregistered,
            serde_json::to_value(&removed)?,
        )?;
        Ok(removed)
    }

    /// Accept a job and start driving it in the background.
    ///
    /// Malformed jobs are refused here and never scheduled.
    pub fn submit(&self, request: JobRequest) -> WardenResult<JobTicket> {
        let state = &self.state;
        let mut job = Job::from_request(&request);
        if job.deadline_ms.is_none() {
            job.deadline_ms = state.config.orchestrator.job_deadline_ms;
        }
        let job_key = job.id.to_string();

        let graph = match Decomposer::decompose(&job, &request, &state.registry) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(job = %job.name, error = %e, "Job rejected");
                state.audit.append(
                    job_key.clone(),
                    Some(job_key),
                    AuditEvent::JobSubmitted,
                    json!({ "accepted": false, "name": job.name, "error": e.to_string() }),
                )?;
                return Err(e);
            }
        };

        state.audit.append(
            job_key.clone(),
            Some(job_key.clone()),
            AuditEvent::JobSubmitted,
            json!({
                "accepted": true,
                "name": job.name,
                "stages": request.stages.len(),
                "subtasks": graph.total_count(),
                "impact": job.impact,
                "deadline_ms": job.deadline_ms,
            }),
        )?;
        for subtask in graph
            .topological_order()
            .into_iter()
            .filter_map(|id| graph.get(id))
        {
            state.audit.append(
                subtask.id.to_string(),
                Some(job_key.clone()),
                AuditEvent::SubtaskCreated,
                json!({
                    "name": subtask.name,
                    "capability": subtask.capability,
                    "dependencies": subtask.dependencies,
                    "status": SubtaskStatus::Queued,
                }),
            )?;
        }

        info!(
            job_id = %job.id,
            name = %job.name,
            subtasks = graph.total_count(),
            "Job submitted"
        );

        let job_id = job.id;
        let runtime = Arc::new(JobRuntime {
            id: job_id,
            deadline: job.deadline_ms.map(Duration::from_millis),
            cell: Mutex::new(JobCell { job, awaiting: 0 }),
            graph: RwLock::new(graph),
            cancel: watch::channel(None).0,
            status: watch::channel(JobStatus::Pending).0,
            started: Instant::now(),
        });
        state.jobs.write().insert(job_id, runtime.clone());
        tokio::spawn(state.clone().drive(runtime));

        Ok(JobTicket {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// Submit a job and wait for it to finish.
    pub async fn run(&self, request: JobRequest) -> WardenResult<JobReport> {
        let ticket = self.submit(request)?;
        self.wait(ticket.job_id).await
    }

    /// Wait until the job reaches a terminal state, then report on it.
    pub async fn wait(&self, job_id: Uuid) -> WardenResult<JobReport> {
        let runtime = self.state.runtime(job_id)?;
        let mut rx = runtime.status.subscribe();
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.report(job_id).await
    }

    /// Ask a running job to stop. In-flight agent calls are abandoned and
    /// unfinished subtasks end as `Failed("cancelled")`.
    pub fn cancel(&self, job_id: Uuid, reason: &str) -> WardenResult<()> {
        let runtime = self.state.runtime(job_id)?;
        if runtime.cell.lock().job.status.is_terminal() {
            return Err(WardenError::Orchestrator(format!(
                "job {job_id} has already finished"
            )));
        }
        self.state.audit.append(
            job_id.to_string(),
            Some(job_id.to_string()),
            AuditEvent::JobCancelled,
            json!({ "reason": reason }),
        )?;
        info!(job_id = %job_id, reason, "Job cancellation requested");
        runtime.cancel.send_replace(Some(reason.to_string()));
        Ok(())
    }

    /// Current status of a known job.
    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        let runtime = self.state.jobs.read().get(&job_id).cloned()?;
        let status = runtime.cell.lock().job.status.clone();
        Some(status)
    }

    /// Snapshot of a job and its subtasks.
    pub async fn job(&self, job_id: Uuid) -> Option<(Job, Vec<Subtask>)> {
        let runtime = self.state.jobs.read().get(&job_id).cloned()?;
        let subtasks = runtime.graph.read().await.iter().cloned().collect();
        let job = runtime.cell.lock().job.clone();
        Some((job, subtasks))
    }

    /// Ids of every job still held in memory.
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.state.jobs.read().keys().copied().collect()
    }

    /// Release a finished job's graph and approval decisions from memory.
    /// Its audit entries stay in the log.
    pub async fn forget(&self, job_id: Uuid) -> WardenResult<()> {
        let runtime = self.state.runtime(job_id)?;
        if !runtime.cell.lock().job.status.is_terminal() {
            return Err(WardenError::Orchestrator(format!(
                "job {job_id} is still running"
            )));
        }
        for id in runtime.graph.read().await.iter().map(|t| t.id) {
            self.state.gate.forget(id);
        }
        self.state.jobs.write().remove(&job_id);
        debug!(job_id = %job_id, "Job forgotten");
        Ok(())
    }

    /// Approval requests waiting for a reviewer.
    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.state.gate.pending()
    }

    /// Record a reviewer decision. The first decision for a subtask wins.
    pub fn record_decision(
        &self,
        subtask_id: Uuid,
        verdict: ReviewVerdict,
    ) -> WardenResult<ApprovalRecord> {
        self.state.gate.record_decision(subtask_id, verdict)
    }

    /// Current report for a job, including its audit trail.
    pub async fn report(&self, job_id: Uuid) -> WardenResult<JobReport> {
        let runtime = self.state.runtime(job_id)?;
        let subtasks: Vec<SubtaskReport> = runtime
            .graph
            .read()
            .await
            .iter()
            .map(SubtaskReport::from)
            .collect();
        let job = runtime.cell.lock().job.clone();

        let done = subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .count();
        let duration_ms = match job.finished_at {
            Some(end) => (end - job.submitted_at).num_milliseconds().max(0) as u64,
            None => runtime.started.elapsed().as_millis() as u64,
        };

        Ok(JobReport {
            job_id,
            summary: format!(
                "{}: {done}/{} subtasks done, job {}",
                job.name,
                subtasks.len(),
                job.status
            ),
            name: job.name,
            status: job.status,
            subtasks,
            duration_ms,
            audit_trail: self
                .state
                .audit
                .query(&AuditFilter::new().job(job_id.to_string())),
        })
    }
}

impl EngineState {
    fn runtime(&self, job_id: Uuid) -> WardenResult<Arc<JobRuntime>> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| WardenError::Orchestrator(format!("unknown job {job_id}")))
    }

    fn record(
        &self,
        entity_id: impl Into<String>,
        job_id: Uuid,
        event: AuditEvent,
        payload: serde_json::Value,
    ) -> WardenResult<AuditEntry> {
        self.audit
            .append(entity_id, Some(job_id.to_string()), event, payload)
    }

    /// Drive a job until it completes or halts.
    async fn drive(self: Arc<Self>, rt: Arc<JobRuntime>) {
        self.set_job_status(&rt, JobStatus::Running);

        let mut running: JoinSet<SubtaskOutcome> = JoinSet::new();
        let mut spawned: HashSet<Uuid> = HashSet::new();
        let mut cancel_rx = rt.cancel.subscribe();
        let deadline = rt.deadline.map(|d| rt.started + d);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let halt = loop {
            if let Some(reason) = rt.cancel.borrow().clone() {
                break Some(Halt::Cancelled(reason));
            }

            let ready: Vec<Uuid> = rt
                .graph
                .read()
                .await
                .ready()
                .iter()
                .map(|t| t.id)
                .filter(|id| !spawned.contains(id))
                .collect();
            for id in ready {
                spawned.insert(id);
                running.spawn(self.clone().run_subtask(rt.clone(), id));
            }

            if running.is_empty() {
                let graph = rt.graph.read().await;
                if graph.is_complete() {
                    break None;
                }
                let reason = match graph.first_failure() {
                    Some(t) => format!("subtask '{}' {}", t.name, t.status),
                    None => "no subtask can make progress".to_string(),
                };
                break Some(Halt::Stalled(reason));
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok(SubtaskOutcome::Settled(reason))) => break Some(Halt::Subtask(reason)),
                    Some(Ok(SubtaskOutcome::Done | SubtaskOutcome::Abandoned)) | None => {}
                    Some(Err(e)) => {
                        error!(job_id = %rt.id, error = %e, "Subtask task died");
                        break Some(Halt::Stalled(format!("subtask task died: {e}")));
                    }
                },
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        break Some(Halt::Stalled("cancel channel closed".into()));
                    }
                }
                () = &mut expiry => break Some(Halt::Deadline),
            }
        };

        match halt {
            None => {
                self.set_job_status(&rt, JobStatus::Completed);
                info!(job_id = %rt.id, "Job completed");
            }
            Some(halt) => {
                running.abort_all();
                while running.join_next().await.is_some() {}
                self.settle_unfinished(&rt, &halt.subtask_reason()).await;
                let reason = halt.job_reason();
                warn!(job_id = %rt.id, reason = %reason, "Job failed");
                self.set_job_status(&rt, JobStatus::Failed { reason });
            }
        }
    }

    /// Fail every non-terminal subtask, dependencies before dependents, and
    /// withdraw its approval request.
    async fn settle_unfinished(&self, rt: &JobRuntime, reason: &str) {
        let unsettled = rt.graph.read().await.unsettled();
        for id in unsettled {
            self.gate.withdraw(id, reason);
            let status = SubtaskStatus::Failed {
                reason: reason.to_string(),
            };
            if let Err(e) = self
                .transition(rt, id, status, AuditEvent::SubtaskStatusChanged, json!({}))
                .await
            {
                error!(subtask_id = %id, error = %e, "Could not settle subtask");
            }
        }
    }

    fn set_job_status(&self, rt: &JobRuntime, status: JobStatus) {
        let mut cell = rt.cell.lock();
        self.set_job_status_locked(rt, &mut cell, status);
    }

    fn set_job_status_locked(&self, rt: &JobRuntime, cell: &mut JobCell, status: JobStatus) {
        if cell.job.status.is_terminal() || cell.job.status == status {
            return;
        }
        let previous = std::mem::replace(&mut cell.job.status, status.clone());
        if status.is_terminal() {
            cell.job.finished_at = Some(Utc::now());
        }
        if let Err(e) = self.record(
            rt.id.to_string(),
            rt.id,
            AuditEvent::JobStatusChanged,
            json!({ "status": status, "previous": previous }),
        ) {
            error!(job_id = %rt.id, error = %e, "Could not audit job status");
        }
        debug!(job_id = %rt.id, status = %status, "Job status changed");
        rt.status.send_replace(status);
    }

    fn enter_review(&self, rt: &JobRuntime) {
        let mut cell = rt.cell.lock();
        cell.awaiting += 1;
        if cell.awaiting == 1 {
            self.set_job_status_locked(rt, &mut cell, JobStatus::AwaitingApproval);
        }
    }

    fn leave_review(&self, rt: &JobRuntime) {
        let mut cell = rt.cell.lock();
        cell.awaiting = cell.awaiting.saturating_sub(1);
        if cell.awaiting == 0 {
            self.set_job_status_locked(rt, &mut cell, JobStatus::Running);
        }
    }

    /// Change a subtask's status and audit it under the graph lock.
    /// Terminal statuses are final.
    async fn transition(
        &self,
        rt: &JobRuntime,
        id: Uuid,
        status: SubtaskStatus,
        event: AuditEvent,
        detail: serde_json::Value,
    ) -> WardenResult<()> {
        let mut graph = rt.graph.write().await;
        let Some(subtask) = graph.get(id) else {
            return Err(WardenError::Orchestrator(format!("unknown subtask {id}")));
        };
        if subtask.status.is_terminal() {
            return Ok(());
        }
        let name = subtask.name.clone();
        let previous = graph.set_status(id, status.clone());

        let mut payload = json!({ "name": name, "status": status, "previous": previous });
        if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), detail) {
            map.extend(extra);
        }
        self.record(id.to_string(), rt.id, event, payload)?;
        debug!(subtask = %name, status = %status, "Subtask status changed");
        Ok(())
    }

    async fn run_subtask(self: Arc<Self>, rt: Arc<JobRuntime>, id: Uuid) -> SubtaskOutcome {
        match self.process_subtask(&rt, id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(subtask_id = %id, error = %e, "Subtask aborted by internal error");
                let reason = format!("internal error: {e}");
                let status = SubtaskStatus::Failed {
                    reason: reason.clone(),
                };
                let detail = json!({ "error_kind": e.kind() });
                if let Err(e) = self
                    .transition(&rt, id, status, AuditEvent::SubtaskStatusChanged, detail)
                    .await
                {
                    error!(subtask_id = %id, error = %e, "Could not record subtask failure");
                }
                SubtaskOutcome::Settled(reason)
            }
        }
    }

    async fn process_subtask(&self, rt: &JobRuntime, id: Uuid) -> WardenResult<SubtaskOutcome> {
        let verdict = {
            let _worker = self
                .workers
                .acquire()
                .await
                .map_err(|_| WardenError::Orchestrator("worker pool closed".into()))?;
            self.execute(rt, id).await?
        };

        match verdict {
            Verdict::Settled(outcome) => Ok(outcome),
            Verdict::Accept(result) => {
                self.complete(rt, id, &result).await?;
                Ok(SubtaskOutcome::Done)
            }
            Verdict::Review { result, reason } => self.review(rt, id, result, reason).await,
        }
    }

    /// Dispatch, retry, reroute and validate until there is a verdict.
    async fn execute(&self, rt: &JobRuntime, id: Uuid) -> WardenResult<Verdict> {
        let (name, capability, payload) = self.dispatch_payload(rt, id).await?;
        let timeout = self.config.timeout_for(&capability);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let validation = self.validator.config();

        let mut excluded: HashSet<String> = HashSet::new();
        let mut preferred: Option<String> = None;
        let mut attempts = 0u32;
        let mut misses = 0u32;

        loop {
            let Some(lease) = self
                .registry
                .acquire(&capability, &excluded, preferred.as_deref())
                .await
            else {
                let reason = if excluded.is_empty() {
                    format!("no agent available for '{capability}'")
                } else {
                    let mut open: Vec<&str> = excluded.iter().map(String::as_str).collect();
                    open.sort_unstable();
                    format!(
                        "no agent available for '{capability}' (circuit open: {})",
                        open.join(", ")
                    )
                };
                return self
                    .fail(rt, id, &name, reason, json!({ "attempts": attempts }))
                    .await;
            };

            let agent_id = lease.id().to_string();
            let agent = lease.agent().clone();
            let attempt = attempts + 1;
            let (agent_ref, agent_name, cap, body) =
                (&agent, agent_id.as_str(), capability.as_str(), &payload);
            let outcome = lease
                .breaker()
                .call(move || async move {
                    self.mark_dispatched(rt, id, agent_name, attempt).await?;
                    match tokio::time::timeout(timeout, agent_ref.execute(cap, body)).await {
                        Ok(result) => result,
                        Err(_) => Err(WardenError::TransientExecution(format!(
                            "no response within {}ms",
                            timeout.as_millis()
                        ))),
                    }
                })
                .await;
            drop(lease);
            for t in &outcome.transitions {
                self.record_circuit(rt.id, &agent_id, t)?;
            }

            if !outcome.invoked {
                let retry_in_ms = match &outcome.result {
                    Err(WardenError::CircuitOpen { retry_in_ms, .. }) => *retry_in_ms,
                    _ => 0,
                };
                self.record(
                    id.to_string(),
                    rt.id,
                    AuditEvent::CircuitRejected,
                    json!({ "agent": agent_id, "retry_in_ms": retry_in_ms }),
                )?;
                warn!(subtask = %name, agent = %agent_id, retry_in_ms, "Circuit open, rerouting");
                if preferred.as_deref() == Some(agent_id.as_str()) {
                    preferred = None;
                }
                excluded.insert(agent_id);
                continue;
            }
            attempts = attempt;

            let output = match outcome.result {
                Ok(output) => output,
                Err(e) => {
                    let retryable = is_retryable(&e);
                    self.record(
                        id.to_string(),
                        rt.id,
                        AuditEvent::ExecutionFailed,
                        json!({
                            "agent": agent_id,
                            "attempt": attempts,
                            "kind": e.kind(),
                            "error": e.to_string(),
                            "retryable": retryable,
                        }),
                    )?;
                    if retryable && attempts < max_attempts {
                        let delay = self.config.retry.delay_for(attempts - 1);
                        warn!(
                            subtask = %name,
                            agent = %agent_id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let reason = if retryable {
                        format!("retries exhausted after {attempts} attempts: {e}")
                    } else {
                        e.to_string()
                    };
                    return self
                        .fail(rt, id, &name, reason, json!({ "agent": agent_id, "attempts": attempts }))
                        .await;
                }
            };

            let mut result = ExecutionResult::new(id, agent_id.clone(), output);
            self.record(
                id.to_string(),
                rt.id,
                AuditEvent::ResultReceived,
                json!({ "agent": agent_id, "attempt": attempts, "output": result.output }),
            )?;

            let subtask = self.subtask(rt, id).await?;
            let report = self.validator.validate(&subtask, &result);
            result.score = report.score;
            self.record(
                id.to_string(),
                rt.id,
                AuditEvent::ResultValidated,
                json!({
                    "agent": agent_id,
                    "score": report.score,
                    "passed": report.passed,
                    "violations": report.violations,
                }),
            )?;
            for signal in self.monitor.record(&agent_id, report.score) {
                self.on_drift_signal(rt.id, signal)?;
            }

            let escalated = self.escalated.lock().contains(&agent_id);
            let mut tier = self.classifier.classify(&subtask, &result);
            if escalated {
                tier = tier.max(self.gate.threshold());
            }
            result.tier = tier;
            self.record(
                id.to_string(),
                rt.id,
                AuditEvent::RiskClassified,
                json!({ "agent": agent_id, "tier": tier, "score": result.score, "escalated": escalated }),
            )?;
            self.store_result(rt, id, &result).await;

            if report.is_compliance_violation() {
                let reason = format!("compliance violation: {}", report.violation_summary());
                warn!(subtask = %name, agent = %agent_id, reason = %reason, "Result failed closed");
                if self.gate.requires_approval(tier) || self.gate.config().override_rejections {
                    return Ok(Verdict::Review { result, reason });
                }
                return self.reject(rt, id, &name, reason, tier).await;
            }

            if !report.passed {
                misses += 1;
                let reason = format!(
                    "validation score {:.2} below threshold {:.2}",
                    report.score, validation.pass_threshold
                );
                if misses <= validation.validation_retries && attempts < max_attempts {
                    info!(subtask = %name, agent = %agent_id, reason = %reason, "Retrying on the same agent");
                    preferred = Some(agent_id);
                    continue;
                }
                if self.gate.config().override_rejections {
                    return Ok(Verdict::Review { result, reason });
                }
                return self.reject(rt, id, &name, reason, tier).await;
            }

            self.transition(
                rt,
                id,
                SubtaskStatus::Validated,
                AuditEvent::SubtaskStatusChanged,
                json!({ "score": result.score, "tier": tier }),
            )
            .await?;

            if self.gate.requires_approval(tier) {
                let reason = if escalated {
                    format!("{tier} tier (agent under drift escalation)")
                } else {
                    format!("{tier} tier")
                };
                return Ok(Verdict::Review { result, reason });
            }
            return Ok(Verdict::Accept(result));
        }
    }

    /// Hold a result at the approval gate until a reviewer decides.
    async fn review(
        &self,
        rt: &JobRuntime,
        id: Uuid,
        result: ExecutionResult,
        reason: String,
    ) -> WardenResult<SubtaskOutcome> {
        let subtask = self.subtask(rt, id).await?;
        self.transition(
            rt,
            id,
            SubtaskStatus::AwaitingApproval,
            AuditEvent::SubtaskStatusChanged,
            json!({ "tier": result.tier, "reason": reason }),
        )
        .await?;

        let request = ApprovalRequest {
            subtask_id: id,
            job_id: rt.id,
            capability: subtask.capability.clone(),
            agent_id: Some(result.agent_id.clone()),
            tier: result.tier,
            reason,
            context: preview(&result.output_text(), 280),
            requested_at: Utc::now(),
        };

        self.enter_review(rt);
        let decision = match self.gate.submit(request) {
            Ok(ticket) => self.gate.wait(ticket).await,
            Err(e) => Err(e),
        };
        self.leave_review(rt);

        match decision {
            Ok(record) if record.is_approved() => {
                self.transition(
                    rt,
                    id,
                    SubtaskStatus::Approved,
                    AuditEvent::SubtaskStatusChanged,
                    json!({ "reviewer": record.reviewer }),
                )
                .await?;
                self.complete(rt, id, &result).await?;
                Ok(SubtaskOutcome::Done)
            }
            Ok(record) => {
                let reason = format!("rejected by {}: {}", record.reviewer, record.rationale);
                self.transition(
                    rt,
                    id,
                    SubtaskStatus::Rejected {
                        reason: reason.clone(),
                    },
                    AuditEvent::SubtaskStatusChanged,
                    json!({ "reviewer": record.reviewer }),
                )
                .await?;
                Ok(SubtaskOutcome::Settled(format!(
                    "subtask '{}' {reason}",
                    subtask.name
                )))
            }
            Err(e) => {
                debug!(subtask = %subtask.name, error = %e, "Approval abandoned");
                Ok(SubtaskOutcome::Abandoned)
            }
        }
    }

    async fn complete(&self, rt: &JobRuntime, id: Uuid, result: &ExecutionResult) -> WardenResult<()> {
        let capability = self.subtask(rt, id).await?.capability;
        self.validator.remember_accepted(&capability, &result.output);
        self.transition(
            rt,
            id,
            SubtaskStatus::Done,
            AuditEvent::SubtaskStatusChanged,
            json!({ "agent": result.agent_id, "score": result.score, "tier": result.tier }),
        )
        .await?;
        info!(subtask_id = %id, agent = %result.agent_id, tier = %result.tier, "Subtask done");
        Ok(())
    }

    async fn fail(
        &self,
        rt: &JobRuntime,
        id: Uuid,
        name: &str,
        reason: String,
        detail: serde_json::Value,
    ) -> WardenResult<Verdict> {
        error!(subtask = %name, reason = %reason, "Subtask failed");
        self.transition(
            rt,
            id,
            SubtaskStatus::Failed {
                reason: reason.clone(),
            },
            AuditEvent::SubtaskStatusChanged,
            detail,
        )
        .await?;
        Ok(Verdict::Settled(SubtaskOutcome::Settled(format!(
            "subtask '{name}' failed: {reason}"
        ))))
    }

    async fn reject(
        &self,
        rt: &JobRuntime,
        id: Uuid,
        name: &str,
        reason: String,
        tier: warden_core::RiskTier,
    ) -> WardenResult<Verdict> {
        self.transition(
            rt,
            id,
            SubtaskStatus::Rejected {
                reason: reason.clone(),
            },
            AuditEvent::SubtaskStatusChanged,
            json!({ "tier": tier }),
        )
        .await?;
        Ok(Verdict::Settled(SubtaskOutcome::Settled(format!(
            "subtask '{name}' rejected: {reason}"
        ))))
    }

    async fn mark_dispatched(
        &self,
        rt: &JobRuntime,
        id: Uuid,
        agent_id: &str,
        attempt: u32,
    ) -> WardenResult<()> {
        if let Some(subtask) = rt.graph.write().await.get_mut(id) {
            subtask.assigned_agent = Some(agent_id.to_string());
            subtask.attempts = attempt;
        }
        self.transition(
            rt,
            id,
            SubtaskStatus::Dispatched,
            AuditEvent::SubtaskDispatched,
            json!({ "agent": agent_id, "attempt": attempt }),
        )
        .await
    }

    async fn store_result(&self, rt: &JobRuntime, id: Uuid, result: &ExecutionResult) {
        if let Some(subtask) = rt.graph.write().await.get_mut(id) {
            subtask.result = Some(result.clone());
        }
    }

    async fn subtask(&self, rt: &JobRuntime, id: Uuid) -> WardenResult<Subtask> {
        rt.graph
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WardenError::Orchestrator(format!("unknown subtask {id}")))
    }

    /// The payload an agent receives: the subtask input plus every
    /// dependency's output keyed by dependency name.
    async fn dispatch_payload(
        &self,
        rt: &JobRuntime,
        id: Uuid,
    ) -> WardenResult<(String, String, serde_json::Value)> {
        let graph = rt.graph.read().await;
        let subtask = graph
            .get(id)
            .ok_or_else(|| WardenError::Orchestrator(format!("unknown subtask {id}")))?;
        let upstream: serde_json::Map<String, serde_json::Value> = subtask
            .dependencies
            .iter()
            .filter_map(|dep| graph.get(*dep))
            .map(|dep| {
                let output = dep
                    .result
                    .as_ref()
                    .map(|r| r.output.clone())
                    .unwrap_or_default();
                (dep.name.clone(), output)
            })
            .collect();
        let job_name = rt.cell.lock().job.name.clone();
        let payload = json!({
            "job": job_name,
            "subtask": subtask.name,
            "input": subtask.input,
            "upstream": upstream,
        });
        Ok((subtask.name.clone(), subtask.capability.clone(), payload))
    }

    fn record_circuit(&self, job_id: Uuid, agent_id: &str, t: &Transition) -> WardenResult<()> {
        self.record(
            agent_id,
            job_id,
            AuditEvent::CircuitTransition,
            json!({ "from": t.from, "to": t.to, "reason": t.reason }),
        )?;
        Ok(())
    }

    fn on_drift_signal(&self, job_id: Uuid, signal: DriftSignal) -> WardenResult<()> {
        let action = match signal {
            DriftSignal::Raised(alert) => {
                self.record(
                    alert.scope.clone(),
                    job_id,
                    AuditEvent::DriftAlert,
                    serde_json::to_value(&alert)?,
                )?;
                self.drift_policy.on_drift(&alert)
            }
            DriftSignal::Cleared { scope, metric } => {
                info!(scope = %scope, mean = metric.mean, "Consistency drift cleared");
                self.record(
                    scope.clone(),
                    job_id,
                    AuditEvent::DriftCleared,
                    serde_json::to_value(&metric)?,
                )?;
                self.drift_policy.on_clear(&scope)
            }
        };
        self.apply_drift_action(job_id, action)
    }

    fn apply_drift_action(&self, job_id: Uuid, action: DriftAction) -> WardenResult<()> {
        let agent_id = match &action {
            DriftAction::None => return Ok(()),
            DriftAction::ReduceConcurrency { agent_id, limit } => {
                self.registry.set_concurrency_limit(agent_id, *limit);
                agent_id
            }
            DriftAction::Probation { agent_id } => {
                if let Some(agent) = self.registry.get(agent_id) {
                    if let Some(t) = agent.breaker().force_half_open() {
                        self.record_circuit(job_id, agent_id, &t)?;
                    }
                }
                agent_id
            }
            DriftAction::Escalate { agent_id } => {
                self.escalated.lock().insert(agent_id.clone());
                agent_id
            }
            DriftAction::Restore { agent_id } => {
                self.registry.restore_concurrency_limit(agent_id);
                self.escalated.lock().remove(agent_id);
                agent_id
            }
        };
        self.record(
            agent_id.clone(),
            job_id,
            AuditEvent::DriftPolicyApplied,
            serde_json::to_value(&action)?,
        )?;
        info!(agent = %agent_id, action = ?action, "Drift policy applied");
        Ok(())
    }
}
