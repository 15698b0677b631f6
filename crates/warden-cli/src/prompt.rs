use async_trait::async_trait;
use std::time::Duration;
use warden_core::{
    ApprovalChannel, ApprovalDecision, ApprovalRequest, ReviewVerdict, RiskTier, WardenResult,
};

/// Approval channel that prompts on stderr and reads the decision from stdin.
pub struct StdinApprovalChannel {
    timeout: Duration,
}

impl StdinApprovalChannel {
    /// Prompts left unanswered for `timeout` are rejected.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// The prompt printed for one request, with ANSI colors.
pub fn format_prompt(request: &ApprovalRequest) -> String {
    let (color, label) = tier_style(request.tier);

    let mut prompt = String::new();
    prompt.push_str("\n\x1b[1;37m== APPROVAL REQUIRED ==\x1b[0m\n");
    prompt.push_str(&format!("  Subtask:    {}\n", request.subtask_id));
    prompt.push_str(&format!("  Capability: {}\n", request.capability));
    if let Some(agent) = &request.agent_id {
        prompt.push_str(&format!("  Agent:      {agent}\n"));
    }
    prompt.push_str(&format!("  Tier:       \x1b[{color}m{label}\x1b[0m\n"));
    prompt.push_str(&format!("  Reason:     {}\n", request.reason));
    if !request.context.is_empty() {
        prompt.push_str(&format!("  Result:     {}\n", request.context));
    }
    prompt.push_str("  Approve? [y/N/reason]: ");
    prompt
}

/// ANSI color code and label for a tier.
pub fn tier_style(tier: RiskTier) -> (&'static str, &'static str) {
    match tier {
        RiskTier::Low => ("32", "LOW"),
        RiskTier::Medium => ("36", "MEDIUM"),
        RiskTier::High => ("33", "HIGH"),
        RiskTier::Critical => ("1;31", "CRITICAL"),
    }
}

/// `y`/`yes` approves; anything else rejects, with non-trivial input kept as the rationale.
pub fn parse_answer(input: &str) -> (bool, Option<String>) {
    let trimmed = input.trim();
    match trimmed.to_lowercase().as_str() {
        "y" | "yes" => (true, None),
        "n" | "no" | "" => (false, None),
        _ => (false, Some(trimmed.to_string())),
    }
}

fn reviewer_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli-user".to_string())
}

#[async_trait]
impl ApprovalChannel for StdinApprovalChannel {
    async fn request_approval(&self, request: ApprovalRequest) -> WardenResult<ReviewVerdict> {
        eprint!("{}", format_prompt(&request));

        let answer = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).map(|_| input)
            }),
        )
        .await;

        let reviewer = reviewer_name();
        let verdict = match answer {
            Ok(Ok(Ok(input))) => match parse_answer(&input) {
                (true, _) => ReviewVerdict::approve(reviewer, "approved at the terminal"),
                (false, reason) => ReviewVerdict::reject(
                    reviewer,
                    reason.unwrap_or_else(|| "rejected at the terminal".into()),
                ),
            },
            Ok(_) => ReviewVerdict::reject(reviewer, "stdin read error"),
            Err(_) => ReviewVerdict::reject(
                reviewer,
                format!("no answer within {}s", self.timeout.as_secs()),
            ),
        };
        let label = match verdict.decision {
            ApprovalDecision::Approved => "APPROVED",
            ApprovalDecision::Rejected => "REJECTED",
        };
        eprintln!("  -> {label}\n");
        Ok(verdict)
    }
}
