//! Human-in-the-loop approval gate.
//!
//! Results at or above the configured tier wait here for a reviewer decision.
//! The first decision recorded for a subtask wins; later ones are refused.
//! Decisions arrive either through [`ApprovalGate::record_decision`] (an
//! operator calling into the orchestrator) or from an [`ApprovalChannel`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{
    ApprovalChannel, ApprovalRecord, ApprovalRequest, ReviewVerdict, RiskTier, WardenError,
    WardenResult,
};
use warden_security::{AuditEvent, AuditLog};

/// Reviewer name stamped on decisions made by a tier timeout.
pub const TIMEOUT_REVIEWER: &str = "system:timeout";

/// What happens when nobody decides in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Record a rejection.
    AutoReject,
    /// Record an approval.
    AutoApprove,
}

/// Decision deadline for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTimeout {
    /// Tier the deadline applies to.
    pub tier: RiskTier,
    /// Time allowed for a decision.
    pub after_ms: u64,
    /// Decision taken when it expires.
    pub action: TimeoutAction,
}

/// Approval settings, loaded from the `[approval]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Lowest tier that needs a reviewer.
    pub threshold: RiskTier,
    /// Send validator rejections to a reviewer instead of failing them outright.
    pub override_rejections: bool,
    /// Tiers without an entry wait indefinitely.
    pub timeouts: Vec<TierTimeout>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            threshold: RiskTier::High,
            override_rejections: false,
            timeouts: Vec::new(),
        }
    }
}

impl ApprovalConfig {
    /// Deadline configured for `tier`, if any.
    pub fn timeout_for(&self, tier: RiskTier) -> Option<&TierTimeout> {
        self.timeouts.iter().find(|t| t.tier == tier)
    }
}

/// Approves every request. For unattended runs and tests.
pub struct AutoApproveChannel;

#[async_trait]
impl ApprovalChannel for AutoApproveChannel {
    async fn request_approval(&self, request: ApprovalRequest) -> WardenResult<ReviewVerdict> {
        info!(
            subtask_id = %request.subtask_id,
            tier = %request.tier,
            "Auto-approving (no human reviewer configured)"
        );
        Ok(ReviewVerdict::approve(
            "system:auto",
            "Auto-approved (no human reviewer configured)",
        ))
    }
}

/// Boxed future returned by a [`CallbackApprovalChannel`] callback.
pub type VerdictFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = WardenResult<ReviewVerdict>> + Send>>;

/// Callback-based approval channel. Delegates to a user-provided async function.
pub struct CallbackApprovalChannel<F>
where
    F: Fn(ApprovalRequest) -> VerdictFuture + Send + Sync,
{
    callback: F,
}

impl<F> CallbackApprovalChannel<F>
where
    F: Fn(ApprovalRequest) -> VerdictFuture + Send + Sync,
{
    /// Wrap an async callback.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> ApprovalChannel for CallbackApprovalChannel<F>
where
    F: Fn(ApprovalRequest) -> VerdictFuture + Send + Sync,
{
    async fn request_approval(&self, request: ApprovalRequest) -> WardenResult<ReviewVerdict> {
        (self.callback)(request).await
    }
}

struct Pending {
    request: ApprovalRequest,
    notify: oneshot::Sender<ApprovalRecord>,
    channel_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<Uuid, Pending>,
    decided: HashMap<Uuid, ApprovalRecord>,
}

struct GateInner {
    config: ApprovalConfig,
    audit: Arc<AuditLog>,
    channel: Option<Arc<dyn ApprovalChannel>>,
    state: Mutex<GateState>,
}

/// Handle returned by [`ApprovalGate::submit`]; redeem it with [`ApprovalGate::wait`].
pub struct ApprovalTicket {
    /// Subtask awaiting review.
    pub subtask_id: Uuid,
    /// Tier that triggered the review.
    pub tier: RiskTier,
    receiver: oneshot::Receiver<ApprovalRecord>,
    timeout: Option<TierTimeout>,
}

/// The approval gate. Cheap to clone.
#[derive(Clone)]
pub struct ApprovalGate {
    inner: Arc<GateInner>,
}

impl ApprovalGate {
    /// A gate with no outbound channel. Decisions arrive through [`ApprovalGate::decide`].
    pub fn new(config: ApprovalConfig, audit: Arc<AuditLog>) -> Self {
        Self::build(config, audit, None)
    }

    /// A gate that forwards every request to `channel` as well.
    pub fn with_channel(
        config: ApprovalConfig,
        audit: Arc<AuditLog>,
        channel: Arc<dyn ApprovalChannel>,
    ) -> Self {
        Self::build(config, audit, Some(channel))
    }

    fn build(
        config: ApprovalConfig,
        audit: Arc<AuditLog>,
        channel: Option<Arc<dyn ApprovalChannel>>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                config,
                audit,
                channel,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Configuration as loaded. See [`ApprovalGate::threshold`] for the effective threshold.
    pub fn config(&self) -> &ApprovalConfig {
        &self.inner.config
    }

    /// Effective review threshold. Never above `High`.
    pub fn threshold(&self) -> RiskTier {
        self.inner.config.threshold.min(RiskTier::High)
    }

    /// Whether a result at `tier` must wait for a reviewer.
    pub fn requires_approval(&self, tier: RiskTier) -> bool {
        tier >= self.threshold()
    }

    /// Open a pending approval for `request.subtask_id` and audit it.
    pub fn submit(&self, request: ApprovalRequest) -> WardenResult<ApprovalTicket> {
        let subtask_id = request.subtask_id;
        let tier = request.tier;
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock();
            if state.pending.contains_key(&subtask_id) || state.decided.contains_key(&subtask_id)
            {
                return Err(WardenError::Approval(format!(
                    "subtask {subtask_id} already has an approval request"
                )));
            }
            self.inner.audit.append(
                subtask_id.to_string(),
                Some(request.job_id.to_string()),
                AuditEvent::ApprovalRequested,
                serde_json::to_value(&request)?,
            )?;
            state.pending.insert(
                subtask_id,
                Pending {
                    request: request.clone(),
                    notify: tx,
                    channel_task: None,
                },
            );
        }

        info!(
            subtask_id = %subtask_id,
            tier = %tier,
            reason = %request.reason,
            "Approval requested"
        );

        if let Some(channel) = self.inner.channel.clone() {
            let gate = self.clone();
            let handle = tokio::spawn(async move {
                match channel.request_approval(request).await {
                    Ok(verdict) => {
                        if let Err(e) = gate.record_decision(subtask_id, verdict) {
                            debug!(subtask_id = %subtask_id, error = %e, "Channel verdict ignored");
                        }
                    }
                    Err(e) => {
                        warn!(subtask_id = %subtask_id, error = %e, "Approval channel failed");
                    }
                }
            });
            let mut state = self.inner.state.lock();
            match state.pending.get_mut(&subtask_id) {
                Some(p) => p.channel_task = Some(handle),
                None => drop(handle),
            }
        }

        Ok(ApprovalTicket {
            subtask_id,
            tier,
            receiver: rx,
            timeout: self.inner.config.timeout_for(tier).cloned(),
        })
    }

    /// Record a reviewer decision. Only the first decision for a subtask is
    /// accepted; any later one, or one for an unknown subtask, is an error.
    pub fn record_decision(
        &self,
        subtask_id: Uuid,
        verdict: ReviewVerdict,
    ) -> WardenResult<ApprovalRecord> {
        let (record, pending) = {
            let mut state = self.inner.state.lock();
            let Some(pending) = state.pending.remove(&subtask_id) else {
                let msg = if state.decided.contains_key(&subtask_id) {
                    format!("subtask {subtask_id} has already been decided")
                } else {
                    format!("no pending approval for subtask {subtask_id}")
                };
                return Err(WardenError::Approval(msg));
            };
            let record = ApprovalRecord::from_verdict(subtask_id, verdict);
            let payload = match serde_json::to_value(&record) {
                Ok(p) => p,
                Err(e) => {
                    state.pending.insert(subtask_id, pending);
                    return Err(e.into());
                }
            };
            if let Err(e) = self.inner.audit.append(
                subtask_id.to_string(),
                Some(pending.request.job_id.to_string()),
                AuditEvent::ApprovalRecorded,
                payload,
            ) {
                state.pending.insert(subtask_id, pending);
                return Err(e);
            }
            state.decided.insert(subtask_id, record.clone());
            (record, pending)
        };

        info!(
            subtask_id = %subtask_id,
            reviewer = %record.reviewer,
            decision = ?record.decision,
            "Approval decision recorded"
        );
        let _ = pending.notify.send(record.clone());
        Ok(record)
    }

    /// Wait for the decision on `ticket`, applying the tier timeout if one
    /// is configured. Fails if the request is withdrawn first.
    pub async fn wait(&self, ticket: ApprovalTicket) -> WardenResult<ApprovalRecord> {
        let ApprovalTicket {
            subtask_id,
            tier,
            mut receiver,
            timeout,
        } = ticket;
        let withdrawn =
            |_| WardenError::Approval(format!("approval for subtask {subtask_id} was withdrawn"));

        let Some(timeout) = timeout else {
            return receiver.await.map_err(withdrawn);
        };

        match tokio::time::timeout(Duration::from_millis(timeout.after_ms), &mut receiver).await {
            Ok(decided) => decided.map_err(withdrawn),
            Err(_) => {
                let rationale = format!("no decision within {}ms for {tier} tier", timeout.after_ms);
                let verdict = match timeout.action {
                    TimeoutAction::AutoReject => ReviewVerdict::reject(TIMEOUT_REVIEWER, rationale),
                    TimeoutAction::AutoApprove => {
                        ReviewVerdict::approve(TIMEOUT_REVIEWER, rationale)
                    }
                };
                match self.record_decision(subtask_id, verdict) {
                    Ok(record) => {
                        warn!(
                            subtask_id = %subtask_id,
                            action = ?timeout.action,
                            "Approval timed out"
                        );
                        Ok(record)
                    }
                    Err(_) => receiver.await.map_err(withdrawn),
                }
            }
        }
    }

    /// Drop a pending request without a decision. Waiters see an error.
    pub fn withdraw(&self, subtask_id: Uuid, reason: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(pending) = state.pending.remove(&subtask_id) else {
            return false;
        };
        if let Some(task) = pending.channel_task {
            task.abort();
        }
        if let Err(e) = self.inner.audit.append(
            subtask_id.to_string(),
            Some(pending.request.job_id.to_string()),
            AuditEvent::ApprovalWithdrawn,
            serde_json::json!({ "reason": reason }),
        ) {
            warn!(subtask_id = %subtask_id, error = %e, "Could not audit withdrawal");
        }
        info!(subtask_id = %subtask_id, reason, "Approval withdrawn");
        true
    }

    /// Requests still waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<ApprovalRequest> = self
            .inner
            .state
            .lock()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect();
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// The recorded decision for a subtask, if any.
    pub fn decision_for(&self, subtask_id: Uuid) -> Option<ApprovalRecord> {
        self.inner.state.lock().decided.get(&subtask_id).cloned()
    }

    /// Drop the stored decision for a finished subtask. Its audit entries
    /// stay in the log. Pending requests are left alone.
    pub fn forget(&self, subtask_id: Uuid) -> Option<ApprovalRecord> {
        self.inner.state.lock().decided.remove(&subtask_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_core::ApprovalDecision;
    use warden_security::AuditFilter;

    fn request(tier: RiskTier) -> ApprovalRequest {
        ApprovalRequest {
            subtask_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            capability: "transfer".into(),
            agent_id: Some("payments".into()),
            tier,
            reason: format!("{tier} tier"),
            context: "move 50k".into(),
            requested_at: Utc::now(),
        }
    }

    fn gate(config: ApprovalConfig) -> (ApprovalGate, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        (ApprovalGate::new(config, audit.clone()), audit)
    }

    #[test]
    fn test_threshold() {
        let (gate, _) = gate(ApprovalConfig::default());
        assert!(!gate.requires_approval(RiskTier::Medium));
        assert!(gate.requires_approval(RiskTier::High));
        assert!(gate.requires_approval(RiskTier::Critical));
    }

    #[test]
    fn test_threshold_capped_at_high() {
        let (gate, _) = gate(ApprovalConfig {
            threshold: RiskTier::Critical,
            ..ApprovalConfig::default()
        });
        assert_eq!(gate.threshold(), RiskTier::High);
        assert!(gate.requires_approval(RiskTier::High));
        assert!(!gate.requires_approval(RiskTier::Medium));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (gate, audit) = gate(ApprovalConfig::default());
        let req = request(RiskTier::High);
        let id = req.subtask_id;
        let ticket = gate.submit(req).unwrap();
        assert_eq!(gate.pending().len(), 1);

        let first = gate
            .record_decision(id, ReviewVerdict::approve("alice", "fine"))
            .unwrap();
        let second = gate
            .record_decision(id, ReviewVerdict::reject("bob", "no"))
            .unwrap_err();
        assert!(second.to_string().contains("already been decided"));

        let seen = gate.wait(ticket).await.unwrap();
        assert_eq!(seen, first);
        assert_eq!(seen.reviewer, "alice");
        assert!(gate.pending().is_empty());
        assert_eq!(gate.decision_for(id), Some(first));

        let recorded = audit.query(&AuditFilter::new().event(AuditEvent::ApprovalRecorded));
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["reviewer"], "alice");
    }

    #[tokio::test]
    async fn test_concurrent_decisions_accept_exactly_one() {
        let (gate, audit) = gate(ApprovalConfig::default());
        let req = request(RiskTier::Critical);
        let id = req.subtask_id;
        let ticket = gate.submit(req).unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.record_decision(id, ReviewVerdict::approve(format!("r{i}"), "ok"))
                    .is_ok()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        let winner = gate.wait(ticket).await.unwrap();
        let recorded = audit.query(&AuditFilter::new().event(AuditEvent::ApprovalRecorded));
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["reviewer"], winner.reviewer.as_str());
    }

    #[test]
    fn test_unknown_subtask_rejected() {
        let (gate, _) = gate(ApprovalConfig::default());
        let err = gate
            .record_decision(Uuid::new_v4(), ReviewVerdict::approve("a", "b"))
            .unwrap_err();
        assert!(err.to_string().contains("no pending approval"));
    }

    #[test]
    fn test_forget_drops_decision_only() {
        let (gate, audit) = gate(ApprovalConfig::default());
        let decided = request(RiskTier::High);
        let decided_id = decided.subtask_id;
        gate.submit(decided).unwrap();
        gate.record_decision(decided_id, ReviewVerdict::approve("alice", "ok"))
            .unwrap();
        let open = request(RiskTier::High);
        let open_id = open.subtask_id;
        gate.submit(open).unwrap();

        assert!(gate.forget(decided_id).is_some());
        assert!(gate.decision_for(decided_id).is_none());
        assert!(gate.forget(open_id).is_none());
        assert_eq!(gate.pending().len(), 1);
        assert_eq!(
            audit
                .query(&AuditFilter::new().entity(decided_id.to_string()))
                .len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_auto_rejects() {
        let config = ApprovalConfig {
            timeouts: vec![TierTimeout {
                tier: RiskTier::High,
                after_ms: 1_000,
                action: TimeoutAction::AutoReject,
            }],
            ..ApprovalConfig::default()
        };
        let (gate, _) = gate(config);
        let req = request(RiskTier::High);
        let id = req.subtask_id;
        let ticket = gate.submit(req).unwrap();

        let record = gate.wait(ticket).await.unwrap();
        assert_eq!(record.decision, ApprovalDecision::Rejected);
        assert_eq!(record.reviewer, TIMEOUT_REVIEWER);
        assert!(gate
            .record_decision(id, ReviewVerdict::approve("late", "sorry"))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_auto_approves_only_its_tier() {
        let config = ApprovalConfig {
            timeouts: vec![TierTimeout {
                tier: RiskTier::High,
                after_ms: 500,
                action: TimeoutAction::AutoApprove,
            }],
            ..ApprovalConfig::default()
        };
        let (gate, _) = gate(config);
        let high = gate.submit(request(RiskTier::High)).unwrap();
        assert!(gate.wait(high).await.unwrap().is_approved());

        let critical = gate.submit(request(RiskTier::Critical)).unwrap();
        let waited =
            tokio::time::timeout(Duration::from_secs(3_600), gate.wait(critical)).await;
        assert!(waited.is_err(), "critical tier has no timeout");
    }

    #[tokio::test]
    async fn test_withdraw_fails_waiter() {
        let (gate, audit) = gate(ApprovalConfig::default());
        let req = request(RiskTier::High);
        let id = req.subtask_id;
        let ticket = gate.submit(req).unwrap();

        assert!(gate.withdraw(id, "job cancelled"));
        assert!(!gate.withdraw(id, "again"));
        let err = gate.wait(ticket).await.unwrap_err();
        assert_eq!(err.kind(), "approval");
        assert_eq!(
            audit
                .query(&AuditFilter::new().event(AuditEvent::ApprovalWithdrawn))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_channel_decides() {
        let audit = Arc::new(AuditLog::in_memory());
        let gate = ApprovalGate::with_channel(
            ApprovalConfig::default(),
            audit,
            Arc::new(AutoApproveChannel),
        );
        let ticket = gate.submit(request(RiskTier::Critical)).unwrap();
        let record = gate.wait(ticket).await.unwrap();
        assert!(record.is_approved());
        assert_eq!(record.reviewer, "system:auto");
    }

    #[tokio::test]
    async fn test_callback_channel() {
        let channel = CallbackApprovalChannel::new(|req: ApprovalRequest| -> VerdictFuture {
            Box::pin(async move {
                Ok(ReviewVerdict::reject(
                    "policy-bot",
                    format!("{} is out of policy", req.capability),
                ))
            })
        });
        let audit = Arc::new(AuditLog::in_memory());
        let gate = ApprovalGate::with_channel(ApprovalConfig::default(), audit, Arc::new(channel));
        let ticket = gate.submit(request(RiskTier::High)).unwrap();
        let record = gate.wait(ticket).await.unwrap();
        assert!(!record.is_approved());
        assert!(record.rationale.contains("transfer"));
    }
}
