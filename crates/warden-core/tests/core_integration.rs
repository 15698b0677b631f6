#![allow(clippy::unwrap_used, clippy::expect_used)]

use warden_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Approval records survive a JSON trip with their decision intact
// ---------------------------------------------------------------------------

#[test]
fn approval_record_json_shape() {
    let id = Uuid::new_v4();
    let record = ApprovalRecord::from_verdict(id, ReviewVerdict::reject("bob", "amount too large"));

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["decision"], "rejected");
    assert_eq!(json["reviewer"], "bob");
    assert_eq!(json["subtask_id"], id.to_string());

    let parsed: ApprovalRecord = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, record);
    assert!(!parsed.is_approved());
}

// ---------------------------------------------------------------------------
// 2. Risk tiers serialize lowercase and sort by severity
// ---------------------------------------------------------------------------

#[test]
fn risk_tiers_sort_by_severity() {
    let mut tiers = vec![RiskTier::Critical, RiskTier::Low, RiskTier::High, RiskTier::Medium];
    tiers.sort();
    assert_eq!(
        tiers,
        vec![RiskTier::Low, RiskTier::Medium, RiskTier::High, RiskTier::Critical]
    );
    assert_eq!(serde_json::to_string(&RiskTier::High).unwrap(), "\"high\"");
    assert_eq!(RiskTier::Low.to_string(), "low");
}

// ---------------------------------------------------------------------------
// 3. Error taxonomy kinds are stable identifiers
// ---------------------------------------------------------------------------

#[test]
fn error_kinds_are_stable() {
    let cases = vec![
        (WardenError::MalformedJob("x".into()), "malformed_job"),
        (WardenError::TransientExecution("x".into()), "transient_execution"),
        (WardenError::ValidationFailure("x".into()), "validation_failure"),
        (WardenError::ComplianceViolation("x".into()), "compliance_violation"),
        (WardenError::DeadlineExceeded("x".into()), "deadline_exceeded"),
    ];
    for (err, kind) in cases {
        assert_eq!(err.kind(), kind);
    }
}

// ---------------------------------------------------------------------------
// 4. A trivial approval channel implementation is object safe
// ---------------------------------------------------------------------------

struct AlwaysReject;

#[async_trait::async_trait]
impl ApprovalChannel for AlwaysReject {
    async fn request_approval(&self, request: ApprovalRequest) -> WardenResult<ReviewVerdict> {
        Ok(ReviewVerdict::reject(
            "policy-bot",
            format!("tier {} not allowed", request.tier),
        ))
    }
}

#[tokio::test]
async fn approval_channel_is_object_safe() {
    let channel: Box<dyn ApprovalChannel> = Box::new(AlwaysReject);
    let verdict = channel
        .request_approval(ApprovalRequest {
            subtask_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            capability: "transfer".into(),
            agent_id: None,
            tier: RiskTier::Critical,
            reason: "tier".into(),
            context: String::new(),
            requested_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(verdict.decision, ApprovalDecision::Rejected);
    assert!(verdict.rationale.contains("critical"));
}
