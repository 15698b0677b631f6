#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end orchestration tests.
//!
//! Drives real jobs through the engine with scripted agents. Checks: staged
//! concurrency and upstream data flow, breaker short-circuiting and
//! rerouting, approval gating and overrides, cancellation, deadlines, drift
//! policies, job retention and audit replay.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use warden_agent::{CircuitState, RetryPolicy, SpecialistAgent};
use warden_core::{ApprovalDecision, ReviewVerdict, RiskTier, WardenError, WardenResult};
use warden_orchestrator::*;
use warden_security::{verify_chain, AuditEvent, AuditFilter};

// ---------------------------------------------------------------------------
// Scripted agents
// ---------------------------------------------------------------------------

type Script = Box<dyn Fn(usize, &Value) -> WardenResult<Value> + Send + Sync>;

/// Answers with `script(call_number, payload)` after an optional delay and
/// keeps call and concurrency counters.
struct ScriptedAgent {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAgent {
    fn new(script: impl Fn(usize, &Value) -> WardenResult<Value> + Send + Sync + 'static) -> Arc<Self> {
        Self::slow(Duration::ZERO, script)
    }

    fn slow(
        delay: Duration,
        script: impl Fn(usize, &Value) -> WardenResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpecialistAgent for ScriptedAgent {
    async fn execute(&self, _capability: &str, payload: &Value) -> WardenResult<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.script)(n, payload)
    }
}

/// Only returns once `parties` agents are inside `execute` at the same time.
struct RendezvousAgent {
    barrier: Arc<Barrier>,
    text: &'static str,
}

#[async_trait]
impl SpecialistAgent for RendezvousAgent {
    async fn execute(&self, _capability: &str, _payload: &Value) -> WardenResult<Value> {
        self.barrier.wait().await;
        Ok(json!(self.text))
    }
}

fn test_config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.retry = RetryPolicy::immediate(3);
    config
}

fn orchestrator(config: WardenConfig) -> Orchestrator {
    Orchestrator::new(config).unwrap()
}

fn register(
    orch: &Orchestrator,
    id: &str,
    capabilities: &[&str],
    limit: usize,
    agent: Arc<dyn SpecialistAgent>,
) {
    orch.register_agent(
        AgentDescriptor::new(id, capabilities.iter().copied()).with_concurrency_limit(limit),
        agent,
    )
    .unwrap();
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn subtask_entries(report: &JobReport, name: &str) -> Vec<(u64, AuditEvent)> {
    let id = report.subtask(name).unwrap().id.to_string();
    report
        .audit_trail
        .iter()
        .filter(|e| e.entity_id == id)
        .map(|e| (e.sequence, e.event))
        .collect()
}

// ---------------------------------------------------------------------------
// Staged execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stages_run_concurrently_then_merge() {
    let orch = orchestrator(test_config());
    let barrier = Arc::new(Barrier::new(2));
    register(
        &orch,
        "summarizer",
        &["summarize"],
        1,
        Arc::new(RendezvousAgent {
            barrier: barrier.clone(),
            text: "short summary",
        }),
    );
    register(
        &orch,
        "translator",
        &["translate"],
        1,
        Arc::new(RendezvousAgent {
            barrier,
            text: "resumen corto",
        }),
    );
    let merger = ScriptedAgent::new(|_, payload| {
        let up = &payload["upstream"];
        Ok(json!(format!(
            "{} / {}",
            up["summarize"].as_str().unwrap_or("?"),
            up["translate"].as_str().unwrap_or("?")
        )))
    });
    register(&orch, "merger", &["merge"], 1, merger.clone());

    let request = JobRequest::new("report")
        .with_payload(json!({"doc": "quarterly numbers"}))
        .stage_of(&["summarize", "translate"])
        .stage_of(&["merge"]);
    let report = tokio::time::timeout(Duration::from_secs(5), orch.run(request))
        .await
        .expect("summarize and translate must run at the same time")
        .unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert!(report
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Done));
    assert_eq!(
        report.subtask("merge").unwrap().output,
        Some(json!("short summary / resumen corto"))
    );
    assert_eq!(merger.calls(), 1);
    assert!(report.summary.contains("3/3"));

    let merge_dispatch = subtask_entries(&report, "merge")
        .into_iter()
        .find(|(_, ev)| *ev == AuditEvent::SubtaskDispatched)
        .unwrap()
        .0;
    for upstream in ["summarize", "translate"] {
        let done = report
            .audit_trail
            .iter()
            .filter(|e| e.entity_id == report.subtask(upstream).unwrap().id.to_string())
            .filter(|e| e.payload["status"] == "done")
            .map(|e| e.sequence)
            .next()
            .unwrap();
        assert!(done < merge_dispatch, "{upstream} must finish before merge starts");
    }

    verify_chain(&orch.audit().entries()).unwrap();
}

#[tokio::test]
async fn test_subtask_audit_order() {
    let orch = orchestrator(test_config());
    register(
        &orch,
        "summarizer",
        &["summarize"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("fine"))),
    );
    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();

    let events: Vec<AuditEvent> = subtask_entries(&report, "summarize")
        .into_iter()
        .map(|(_, ev)| ev)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::SubtaskCreated,
            AuditEvent::SubtaskDispatched,
            AuditEvent::ResultReceived,
            AuditEvent::ResultValidated,
            AuditEvent::RiskClassified,
            AuditEvent::SubtaskStatusChanged,
            AuditEvent::SubtaskStatusChanged,
        ]
    );
    for pair in report.audit_trail.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
    }
}

#[tokio::test]
async fn test_malformed_job_is_refused_and_audited() {
    let orch = orchestrator(test_config());
    register(&orch, "s", &["summarize"], 1, ScriptedAgent::new(|_, _| Ok(json!("x"))));

    let err = orch
        .submit(JobRequest::new("bad").stage_of(&["summarize", "teleport"]))
        .unwrap_err();
    assert!(matches!(err, WardenError::MalformedJob(_)));
    assert!(orch.job_ids().is_empty());

    let submitted = orch
        .audit()
        .query(&AuditFilter::new().event(AuditEvent::JobSubmitted));
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].payload["accepted"], false);
}

// ---------------------------------------------------------------------------
// Retries and circuit breaking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::new(|n, _| {
        if n < 3 {
            Err(WardenError::TransientExecution("503".into()))
        } else {
            Ok(json!("third time lucky"))
        }
    });
    register(&orch, "flaky", &["summarize"], 1, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(agent.calls(), 3);
    assert_eq!(report.subtask("summarize").unwrap().attempts, 3);
    let failures = subtask_entries(&report, "summarize")
        .into_iter()
        .filter(|(_, ev)| *ev == AuditEvent::ExecutionFailed)
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::new(|_, _| Err(WardenError::TransientExecution("timeout".into())));
    register(&orch, "down", &["summarize"], 1, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(agent.calls(), 3);
    match &report.subtask("summarize").unwrap().status {
        SubtaskStatus::Failed { reason } => assert!(reason.contains("retries exhausted")),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(matches!(report.status, JobStatus::Failed { .. }));
}

#[tokio::test]
async fn test_agent_timeout_counts_as_transient() {
    let mut config = test_config();
    config.retry = RetryPolicy::immediate(2);
    config
        .orchestrator
        .capability_timeouts_ms
        .insert("summarize".into(), 20);
    let orch = orchestrator(config);
    let agent = ScriptedAgent::slow(Duration::from_secs(5), |_, _| Ok(json!("late")));
    register(&orch, "sleepy", &["summarize"], 1, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(agent.calls(), 2);
    let kinds: Vec<String> = report
        .audit_trail
        .iter()
        .filter(|e| e.event == AuditEvent::ExecutionFailed)
        .map(|e| e.payload["kind"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["transient_execution", "transient_execution"]);
}

#[tokio::test]
async fn test_open_circuit_short_circuits_sixth_dispatch() {
    let orch = orchestrator(test_config());
    let broken = ScriptedAgent::new(|_, _| Err(WardenError::Execution("model crashed".into())));
    register(&orch, "broken", &["summarize"], 1, broken.clone());

    for _ in 0..5 {
        let report = orch
            .run(JobRequest::new("j").stage_of(&["summarize"]))
            .await
            .unwrap();
        assert!(matches!(report.status, JobStatus::Failed { .. }));
    }
    assert_eq!(broken.calls(), 5);
    assert_eq!(
        orch.registry().get("broken").unwrap().breaker().state(),
        warden_agent::CircuitState::Open
    );

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(broken.calls(), 5, "sixth dispatch must not reach the agent");
    match &report.subtask("summarize").unwrap().status {
        SubtaskStatus::Failed { reason } => assert!(reason.contains("circuit open: broken")),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(
        subtask_entries(&report, "summarize")
            .into_iter()
            .filter(|(_, ev)| *ev == AuditEvent::CircuitRejected)
            .count(),
        1
    );

    let opened = orch
        .audit()
        .query(&AuditFilter::new().entity("broken").event(AuditEvent::CircuitTransition));
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].payload["to"], "open");
}

#[tokio::test]
async fn test_open_circuit_reroutes_to_healthy_agent() {
    let orch = orchestrator(test_config());
    let broken = ScriptedAgent::new(|_, _| Err(WardenError::Execution("bad weights".into())));
    let backup = ScriptedAgent::new(|_, _| Ok(json!("backup summary")));
    register(&orch, "a-primary", &["summarize"], 1, broken.clone());
    register(&orch, "b-backup", &["summarize"], 1, backup.clone());

    for _ in 0..5 {
        orch.run(JobRequest::new("j").stage_of(&["summarize"]))
            .await
            .unwrap();
    }
    assert_eq!(broken.calls(), 5);
    assert_eq!(backup.calls(), 0);

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    let sub = report.subtask("summarize").unwrap();
    assert_eq!(sub.agent.as_deref(), Some("b-backup"));
    assert_eq!(sub.attempts, 1, "a short-circuited dispatch is not an attempt");
    assert_eq!(broken.calls(), 5);
    assert_eq!(backup.calls(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_per_agent_concurrency_limit() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::slow(Duration::from_millis(20), |_, _| Ok(json!("ok")));
    register(&orch, "single", &["summarize"], 1, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize", "summarize", "summarize", "summarize"]))
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(agent.calls(), 4);
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_global_worker_limit() {
    let mut config = test_config();
    config.orchestrator.max_workers = 2;
    let orch = orchestrator(config);
    let agent = ScriptedAgent::slow(Duration::from_millis(20), |_, _| Ok(json!("ok")));
    register(&orch, "wide", &["summarize"], 10, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"; 6]))
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(agent.calls(), 6);
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Approval gate
// ---------------------------------------------------------------------------

fn high_risk_config() -> WardenConfig {
    let mut config = test_config();
    config
        .risk
        .capability_floors
        .insert("transfer".into(), RiskTier::High);
    config
}

#[tokio::test]
async fn test_high_tier_waits_for_approval() {
    let orch = orchestrator(high_risk_config());
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("wire 50k to acme"))),
    );

    let ticket = orch
        .submit(JobRequest::new("payout").stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    assert_eq!(orch.status(ticket.job_id), Some(JobStatus::AwaitingApproval));

    let request = orch.pending_approvals().remove(0);
    assert_eq!(request.tier, RiskTier::High);
    assert_eq!(request.agent_id.as_deref(), Some("payments"));
    assert!(request.context.contains("wire 50k"));

    orch.record_decision(request.subtask_id, ReviewVerdict::approve("alice", "expected"))
        .unwrap();
    let report = orch.wait(ticket.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let entries = subtask_entries(&report, "transfer");
    let approved_at = entries
        .iter()
        .find(|(_, ev)| *ev == AuditEvent::ApprovalRecorded)
        .unwrap()
        .0;
    let done_at = report
        .audit_trail
        .iter()
        .find(|e| e.entity_id == request.subtask_id.to_string() && e.payload["status"] == "done")
        .unwrap()
        .sequence;
    assert!(approved_at < done_at);
    assert_eq!(report.subtask("transfer").unwrap().tier, Some(RiskTier::High));
}

#[tokio::test]
async fn test_rejected_approval_fails_job() {
    let orch = orchestrator(high_risk_config());
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("wire 5M offshore"))),
    );
    let ticket = orch
        .submit(JobRequest::new("payout").stage_of(&["transfer"]).stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let request = orch.pending_approvals().remove(0);
    orch.record_decision(request.subtask_id, ReviewVerdict::reject("bob", "too large"))
        .unwrap();

    let report = orch.wait(ticket.job_id).await.unwrap();
    match &report.status {
        JobStatus::Failed { reason } => assert!(reason.contains("rejected by bob")),
        other => panic!("unexpected status {other:?}"),
    }
    let statuses: Vec<&SubtaskStatus> = report.subtasks.iter().map(|s| &s.status).collect();
    assert!(matches!(statuses[0], SubtaskStatus::Rejected { .. }));
    assert_eq!(
        statuses[1],
        &SubtaskStatus::Failed {
            reason: "cancelled: job failed".into()
        }
    );
}

#[tokio::test]
async fn test_concurrent_decisions_first_writer_wins() {
    let orch = orchestrator(high_risk_config());
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("refund"))),
    );
    let ticket = orch
        .submit(JobRequest::new("refund").stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let subtask_id = orch.pending_approvals()[0].subtask_id;

    let mut handles = Vec::new();
    for i in 0..8 {
        let orch = orch.clone();
        handles.push(tokio::spawn(async move {
            let verdict = if i % 2 == 0 {
                ReviewVerdict::approve(format!("reviewer-{i}"), "ok")
            } else {
                ReviewVerdict::reject(format!("reviewer-{i}"), "no")
            };
            orch.record_decision(subtask_id, verdict)
        }));
    }
    let mut winners = Vec::new();
    for h in handles {
        if let Ok(record) = h.await.unwrap() {
            winners.push(record);
        }
    }
    assert_eq!(winners.len(), 1);

    let report = orch.wait(ticket.job_id).await.unwrap();
    let recorded = orch.audit().query(
        &AuditFilter::new()
            .entity(subtask_id.to_string())
            .event(AuditEvent::ApprovalRecorded),
    );
    assert_eq!(recorded.len(), 1);
    match winners[0].decision {
        ApprovalDecision::Approved => assert_eq!(report.status, JobStatus::Completed),
        ApprovalDecision::Rejected => assert!(matches!(report.status, JobStatus::Failed { .. })),
    }
    assert_eq!(recorded[0].payload["reviewer"], winners[0].reviewer.as_str());
}

#[tokio::test]
async fn test_approval_timeout_auto_rejects() {
    let mut config = high_risk_config();
    config.approval.timeouts.push(TierTimeout {
        tier: RiskTier::High,
        after_ms: 50,
        action: TimeoutAction::AutoReject,
    });
    let orch = orchestrator(config);
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("close account"))),
    );

    let report = orch
        .run(JobRequest::new("close").stage_of(&["transfer"]))
        .await
        .unwrap();
    match &report.subtask("transfer").unwrap().status {
        SubtaskStatus::Rejected { reason } => assert!(reason.contains(TIMEOUT_REVIEWER)),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_compliance_violation_fails_closed() {
    let mut config = test_config();
    config.validation.forbidden_patterns = vec![r"\b\d{3}-\d{2}-\d{4}\b".into()];
    let orch = orchestrator(config);
    let agent = ScriptedAgent::new(|_, _| Ok(json!("customer ssn is 123-45-6789")));
    register(&orch, "leaky", &["summarize"], 1, agent.clone());

    let report = orch
        .run(JobRequest::new("j").stage_of(&["summarize"]))
        .await
        .unwrap();
    assert_eq!(agent.calls(), 1, "compliance hits are never retried");
    match &report.subtask("summarize").unwrap().status {
        SubtaskStatus::Rejected { reason } => assert!(reason.contains("compliance violation")),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_validation_miss_retries_once_on_same_agent() {
    let mut config = test_config();
    config
        .validation
        .required_fields
        .insert("merge".into(), vec!["title".into()]);
    config.validation.pass_threshold = 0.9;
    let orch = orchestrator(config);
    let agent = ScriptedAgent::new(|n, _| Ok(json!({ "title": "t", format!("extra{n}"): n })));
    register(&orch, "merger", &["merge"], 1, agent.clone());

    let first = orch
        .run(JobRequest::new("seed").stage_of(&["merge"]))
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    let report = orch
        .run(JobRequest::new("drifted").stage_of(&["merge"]))
        .await
        .unwrap();
    assert_eq!(agent.calls(), 3, "one validation retry");
    match &report.subtask("merge").unwrap().status {
        SubtaskStatus::Rejected { reason } => assert!(reason.contains("validation score")),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_override_approves_compliance_rejection() {
    let mut config = test_config();
    config.validation.forbidden_patterns = vec![r"\b\d{3}-\d{2}-\d{4}\b".into()];
    config.approval.override_rejections = true;
    let orch = orchestrator(config);
    let agent = ScriptedAgent::new(|_, _| Ok(json!("customer ssn is 123-45-6789")));
    register(&orch, "leaky", &["summarize"], 1, agent.clone());

    let ticket = orch
        .submit(JobRequest::new("j").stage_of(&["summarize"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let request = orch.pending_approvals().remove(0);
    assert!(request.reason.contains("compliance violation"));
    assert_eq!(orch.status(ticket.job_id), Some(JobStatus::AwaitingApproval));

    orch.record_decision(request.subtask_id, ReviewVerdict::approve("dpo", "redacted downstream"))
        .unwrap();
    let report = orch.wait(ticket.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.subtask("summarize").unwrap().status, SubtaskStatus::Done);
    assert_eq!(agent.calls(), 1);

    let events: Vec<AuditEvent> = subtask_entries(&report, "summarize")
        .into_iter()
        .map(|(_, ev)| ev)
        .collect();
    let approved = events
        .iter()
        .position(|ev| *ev == AuditEvent::ApprovalRecorded)
        .unwrap();
    assert_eq!(events.last(), Some(&AuditEvent::SubtaskStatusChanged));
    assert!(approved < events.len() - 1);
}

#[tokio::test]
async fn test_override_reviews_exhausted_validation() {
    let mut config = test_config();
    config
        .validation
        .required_fields
        .insert("merge".into(), vec!["title".into()]);
    config.validation.pass_threshold = 0.9;
    config.approval.override_rejections = true;
    let orch = orchestrator(config);
    let agent = ScriptedAgent::new(|n, _| Ok(json!({ "title": "t", format!("extra{n}"): n })));
    register(&orch, "merger", &["merge"], 1, agent.clone());

    let seed = orch
        .run(JobRequest::new("seed").stage_of(&["merge"]))
        .await
        .unwrap();
    assert_eq!(seed.status, JobStatus::Completed);

    let approved = orch
        .submit(JobRequest::new("drifted").stage_of(&["merge"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let request = orch.pending_approvals().remove(0);
    assert!(request.reason.contains("validation score"));
    assert_eq!(agent.calls(), 3, "review only after the validation retry");
    orch.record_decision(request.subtask_id, ReviewVerdict::approve("lead", "shape changed on purpose"))
        .unwrap();
    let report = orch.wait(approved.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.subtask("merge").unwrap().status, SubtaskStatus::Done);

    let refused = orch
        .submit(JobRequest::new("drifted again").stage_of(&["merge"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let request = orch.pending_approvals().remove(0);
    orch.record_decision(request.subtask_id, ReviewVerdict::reject("lead", "not again"))
        .unwrap();
    let report = orch.wait(refused.job_id).await.unwrap();
    assert!(matches!(report.status, JobStatus::Failed { .. }));
    assert!(matches!(
        report.subtask("merge").unwrap().status,
        SubtaskStatus::Rejected { .. }
    ));
}

// ---------------------------------------------------------------------------
// Cancellation and deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_running_job() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::slow(Duration::from_secs(60), |_, _| Ok(json!("never")));
    register(&orch, "slow", &["summarize"], 1, agent.clone());

    let ticket = orch
        .submit(JobRequest::new("j").stage_of(&["summarize"]).stage_of(&["summarize"]))
        .unwrap();
    eventually("dispatch", || agent.calls() == 1).await;
    orch.cancel(ticket.job_id, "operator request").unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), orch.wait(ticket.job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        report.status,
        JobStatus::Failed {
            reason: "cancelled: operator request".into()
        }
    );
    for s in &report.subtasks {
        assert_eq!(
            s.status,
            SubtaskStatus::Failed {
                reason: "cancelled".into()
            }
        );
    }
    assert!(orch.cancel(ticket.job_id, "again").is_err());
    assert_eq!(
        orch.registry().get("slow").unwrap().load(),
        0,
        "cancelled calls release their agent slot"
    );
}

fn terminal_sequence(report: &JobReport, name: &str) -> u64 {
    let id = report.subtask(name).unwrap().id.to_string();
    report
        .audit_trail
        .iter()
        .filter(|e| e.entity_id == id && e.event == AuditEvent::SubtaskStatusChanged)
        .find(|e| e.payload["status"].get("failed").is_some())
        .unwrap()
        .sequence
}

#[tokio::test]
async fn test_cancel_settles_dependencies_before_dependents() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::slow(Duration::from_secs(60), |_, _| Ok(json!("never")));
    register(&orch, "slow", &["summarize"], 2, agent.clone());

    let ticket = orch
        .submit(JobRequest::new("j").stage(vec![
            StageTask::new("summarize").named("x").after("y"),
            StageTask::new("summarize").named("y"),
        ]))
        .unwrap();
    eventually("dispatch", || agent.calls() == 1).await;
    orch.cancel(ticket.job_id, "operator request").unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), orch.wait(ticket.job_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(agent.calls(), 1, "x never ran");
    assert!(terminal_sequence(&report, "y") < terminal_sequence(&report, "x"));

    let created = |name: &str| {
        subtask_entries(&report, name)
            .into_iter()
            .find(|(_, ev)| *ev == AuditEvent::SubtaskCreated)
            .unwrap()
            .0
    };
    assert!(created("y") < created("x"));
}

#[tokio::test]
async fn test_cancel_withdraws_pending_approval() {
    let orch = orchestrator(high_risk_config());
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("wire"))),
    );
    let ticket = orch
        .submit(JobRequest::new("payout").stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let subtask_id = orch.pending_approvals()[0].subtask_id;

    orch.cancel(ticket.job_id, "changed my mind").unwrap();
    let report = orch.wait(ticket.job_id).await.unwrap();
    assert!(matches!(report.status, JobStatus::Failed { .. }));
    assert!(orch.pending_approvals().is_empty());
    assert!(orch
        .record_decision(subtask_id, ReviewVerdict::approve("late", "sorry"))
        .is_err());
    assert_eq!(
        report
            .audit_trail
            .iter()
            .filter(|e| e.event == AuditEvent::ApprovalWithdrawn)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_job_deadline() {
    let orch = orchestrator(test_config());
    let agent = ScriptedAgent::slow(Duration::from_secs(60), |_, _| Ok(json!("never")));
    register(&orch, "slow", &["summarize"], 1, agent);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        orch.run(
            JobRequest::new("j")
                .stage_of(&["summarize"])
                .with_deadline_ms(50),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        report.status,
        JobStatus::Failed {
            reason: "deadline exceeded".into()
        }
    );
    assert_eq!(
        report.subtask("summarize").unwrap().status,
        SubtaskStatus::Failed {
            reason: "deadline exceeded".into()
        }
    );
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_drift_alerts_once_and_escalates() {
    let mut config = test_config();
    config.drift.window = 5;
    config.validation.pass_threshold = 0.2;
    let orch = Orchestrator::builder(config)
        .approval_channel(Arc::new(AutoApproveChannel))
        .build()
        .unwrap();
    let agent = ScriptedAgent::new(|n, _| {
        if n <= 5 {
            Ok(json!({ "summary": "steady", "words": 120 }))
        } else {
            Ok(json!({ format!("k{n}"): n }))
        }
    });
    register(&orch, "summarizer", &["summarize"], 1, agent);

    for _ in 0..10 {
        let report = orch
            .run(JobRequest::new("j").stage_of(&["summarize"]))
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Completed);
    }

    let alerts = orch
        .audit()
        .query(&AuditFilter::new().entity("summarizer").event(AuditEvent::DriftAlert));
    assert_eq!(alerts.len(), 1);
    assert!(matches!(
        orch.monitor().get_drift("summarizer"),
        DriftStatus::Drifting(_)
    ));

    let applied = orch
        .audit()
        .query(&AuditFilter::new().event(AuditEvent::DriftPolicyApplied));
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].payload["action"], "escalate");

    let approvals = orch
        .audit()
        .query(&AuditFilter::new().event(AuditEvent::ApprovalRecorded));
    assert_eq!(approvals.len(), 5, "every drifting result went to review");
    assert!(approvals
        .iter()
        .all(|e| e.payload["reviewer"] == "system:auto"));
}

/// Five steady results, five with a new shape each, then steady again.
fn shifting_summarizer() -> Arc<ScriptedAgent> {
    ScriptedAgent::new(|n, _| {
        if (6..=10).contains(&n) {
            Ok(json!({ format!("k{n}"): n }))
        } else {
            Ok(json!({ "summary": "steady", "words": 120 }))
        }
    })
}

fn drift_config(response: DriftResponse) -> WardenConfig {
    let mut config = test_config();
    config.drift.window = 5;
    config.drift.response = response;
    config.validation.pass_threshold = 0.2;
    config
}

async fn run_summaries(orch: &Orchestrator, count: usize) {
    for _ in 0..count {
        let report = orch
            .run(JobRequest::new("j").stage_of(&["summarize"]))
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Completed);
    }
}

fn applied_actions(orch: &Orchestrator) -> Vec<String> {
    orch.audit()
        .query(&AuditFilter::new().event(AuditEvent::DriftPolicyApplied))
        .iter()
        .map(|e| e.payload["action"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_drift_reduces_concurrency_until_cleared() {
    let orch = orchestrator(drift_config(DriftResponse::ReduceConcurrency { limit: 1 }));
    register(&orch, "summarizer", &["summarize"], 3, shifting_summarizer());
    let limit = || orch.registry().get("summarizer").unwrap().limit();

    run_summaries(&orch, 5).await;
    assert_eq!(limit(), 3);

    run_summaries(&orch, 1).await;
    assert!(matches!(
        orch.monitor().get_drift("summarizer"),
        DriftStatus::Drifting(_)
    ));
    assert_eq!(limit(), 1);

    run_summaries(&orch, 9).await;
    assert!(matches!(
        orch.monitor().get_drift("summarizer"),
        DriftStatus::Stable(_)
    ));
    assert_eq!(limit(), 3);
    assert_eq!(applied_actions(&orch), vec!["reduce_concurrency", "restore"]);
    assert_eq!(
        orch.audit()
            .query(&AuditFilter::new().entity("summarizer").event(AuditEvent::DriftCleared))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_drift_probation_forces_trial_call() {
    let orch = orchestrator(drift_config(DriftResponse::Probation));
    register(&orch, "summarizer", &["summarize"], 1, shifting_summarizer());
    let state = || orch.registry().get("summarizer").unwrap().breaker().state();

    run_summaries(&orch, 6).await;
    assert_eq!(state(), CircuitState::HalfOpen);
    assert_eq!(applied_actions(&orch), vec!["probation"]);

    run_summaries(&orch, 1).await;
    assert_eq!(state(), CircuitState::Closed);

    let transitions: Vec<(String, String)> = orch
        .audit()
        .query(&AuditFilter::new().entity("summarizer").event(AuditEvent::CircuitTransition))
        .iter()
        .map(|e| {
            (
                e.payload["to"].as_str().unwrap_or_default().to_string(),
                e.payload["reason"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("half_open".to_string(), "probation".to_string()),
            ("closed".to_string(), "trial call succeeded".to_string()),
        ]
    );
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_forget_releases_finished_job() {
    let orch = orchestrator(high_risk_config());
    register(
        &orch,
        "payments",
        &["transfer"],
        1,
        ScriptedAgent::new(|_, _| Ok(json!("refund"))),
    );
    let ticket = orch
        .submit(JobRequest::new("refund").stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;
    let subtask_id = orch.pending_approvals()[0].subtask_id;
    assert!(orch.forget(ticket.job_id).await.is_err(), "job still running");

    orch.record_decision(subtask_id, ReviewVerdict::approve("alice", "ok"))
        .unwrap();
    orch.wait(ticket.job_id).await.unwrap();
    assert!(orch.gate().decision_for(subtask_id).is_some());
    let logged = orch.audit().len();

    orch.forget(ticket.job_id).await.unwrap();
    assert!(orch.status(ticket.job_id).is_none());
    assert!(!orch.job_ids().contains(&ticket.job_id));
    assert!(orch.gate().decision_for(subtask_id).is_none());
    assert!(orch.report(ticket.job_id).await.is_err());
    assert!(orch.forget(ticket.job_id).await.is_err());
    assert_eq!(orch.audit().len(), logged, "audit entries are kept");
    assert!(orch
        .record_decision(subtask_id, ReviewVerdict::reject("bob", "late"))
        .is_err());
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_matches_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = high_risk_config();
    config.audit.dir = Some(tmp.path().join("audit"));
    let orch = orchestrator(config);
    register(&orch, "s", &["summarize"], 2, ScriptedAgent::new(|_, _| Ok(json!("sum"))));
    register(
        &orch,
        "x",
        &["translate"],
        1,
        ScriptedAgent::new(|_, _| Err(WardenError::Execution("no such language".into()))),
    );
    register(&orch, "p", &["transfer"], 1, ScriptedAgent::new(|_, _| Ok(json!("pay"))));

    let ok = orch
        .run(JobRequest::new("ok").stage_of(&["summarize", "summarize"]))
        .await
        .unwrap();
    let failed = orch
        .run(JobRequest::new("failed").stage_of(&["summarize", "translate"]).stage_of(&["summarize"]))
        .await
        .unwrap();
    let waiting = orch
        .submit(JobRequest::new("waiting").stage_of(&["transfer"]))
        .unwrap();
    eventually("approval request", || !orch.pending_approvals().is_empty()).await;

    orch.audit().flush().await;
    let entries = warden_security::load_jsonl(tmp.path().join("audit").join(warden_security::AUDIT_FILE))
        .await
        .unwrap();
    verify_chain(&entries).unwrap();
    let state = replay(&entries).unwrap();

    for job_id in [ok.job_id, failed.job_id, waiting.job_id] {
        let live = orch.status(job_id).unwrap();
        assert_eq!(state.jobs[&job_id.to_string()], live);
        let (_, subtasks) = orch.job(job_id).await.unwrap();
        for s in subtasks {
            assert_eq!(state.subtasks[&s.id.to_string()], s.status, "subtask {}", s.name);
        }
    }
    assert_eq!(state.jobs[&waiting.job_id.to_string()], JobStatus::AwaitingApproval);
    assert_eq!(state.pending_approvals().len(), 1);
}
