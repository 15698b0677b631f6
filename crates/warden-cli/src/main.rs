mod demo;
mod prompt;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use demo::{DemoAgent, DemoAgentConfig};
use prompt::StdinApprovalChannel;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_orchestrator::{
    replay, AgentDescriptor, AutoApproveChannel, JobReport, JobRequest, Orchestrator, SubtaskStatus,
    WardenConfig,
};
use warden_security::{load_jsonl, verify_chain, write_jsonl, AuditEvent, AuditFilter, AUDIT_FILE};

#[derive(Parser)]
#[command(name = "warden", about = "Warden: governed multi-agent job execution")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job file against the agents declared in the config
    Run {
        /// Job definition (TOML)
        job: PathBuf,
        /// Approve every request without prompting
        #[arg(long)]
        auto_approve: bool,
        /// Seconds to wait for an answer at the prompt
        #[arg(long, default_value_t = 300)]
        prompt_timeout: u64,
        /// Print the full report, audit trail included, as JSON
        #[arg(long)]
        json: bool,
    },
    /// List approval requests still open in an audit file
    Approvals {
        /// Audit file (defaults to `<audit.dir>/audit.jsonl`)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Inspect an audit file
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Work with the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Write matching entries to stdout as JSON lines
    Export {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        entity: Option<String>,
        /// Event kind, e.g. `approval_recorded` (repeatable)
        #[arg(long)]
        event: Vec<String>,
        /// Minimum sequence number
        #[arg(long)]
        since: Option<u64>,
    },
    /// Check sequence numbers and the hash chain
    Verify {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Rebuild job and subtask state from the entries
    Replay {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate the config file
    Validate,
}

/// The config file: engine sections plus the demo agents to register.
#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(flatten)]
    engine: WardenConfig,
    #[serde(default)]
    agents: Vec<DemoAgentConfig>,
}

impl CliConfig {
    fn parse(text: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(text)?;
        config.engine.validate()?;
        Ok(config)
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Like [`CliConfig::load`], but a missing file means defaults.
    fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(Self {
            engine: WardenConfig::default(),
            agents: Vec::new(),
        })
    }

    fn audit_file(&self, explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        explicit
            .or_else(|| self.engine.audit.dir.as_ref().map(|dir| dir.join(AUDIT_FILE)))
            .ok_or_else(|| anyhow!("no audit file: pass --file or set [audit].dir"))
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Run {
            job,
            auto_approve,
            prompt_timeout,
            json,
        } => {
            let config = CliConfig::load_or_default(&cli.config)?;
            run_job(config, &job, auto_approve, prompt_timeout, json).await?;
        }
        Commands::Approvals { file } => {
            let config = CliConfig::load_or_default(&cli.config)?;
            let entries = load_jsonl(config.audit_file(file)?).await?;
            let state = replay(&entries)?;
            let pending = state.pending_approvals();
            if pending.is_empty() {
                println!("No pending approvals.");
            } else {
                println!("Pending approvals:");
                for request in &pending {
                    println!(
                        "  {}  [{}] {} via {}: {}",
                        request["subtask_id"].as_str().unwrap_or("?"),
                        request["tier"].as_str().unwrap_or("?"),
                        request["capability"].as_str().unwrap_or("?"),
                        request["agent_id"].as_str().unwrap_or("-"),
                        request["reason"].as_str().unwrap_or(""),
                    );
                }
                println!("\nTotal: {} request(s)", pending.len());
            }
        }
        Commands::Audit { action } => {
            let config = CliConfig::load_or_default(&cli.config)?;
            match action {
                AuditAction::Export {
                    file,
                    job,
                    entity,
                    event,
                    since,
                } => {
                    let entries = load_jsonl(config.audit_file(file)?).await?;
                    let mut filter = AuditFilter::new();
                    if let Some(job) = job {
                        filter = filter.job(job);
                    }
                    if let Some(entity) = entity {
                        filter = filter.entity(entity);
                    }
                    for name in &event {
                        let kind = AuditEvent::parse(name)
                            .ok_or_else(|| anyhow!("unknown audit event '{name}'"))?;
                        filter = filter.event(kind);
                    }
                    if let Some(since) = since {
                        filter = filter.since(since);
                    }
                    let matching: Vec<_> =
                        entries.into_iter().filter(|e| filter.matches(e)).collect();
                    write_jsonl(&mut std::io::stdout().lock(), &matching)?;
                }
                AuditAction::Verify { file } => {
                    let path = config.audit_file(file)?;
                    let entries = load_jsonl(&path).await?;
                    verify_chain(&entries)?;
                    println!(
                        "{}: {} entries, chain intact",
                        path.display(),
                        entries.len()
                    );
                }
                AuditAction::Replay { file } => {
                    let entries = load_jsonl(config.audit_file(file)?).await?;
                    let state = replay(&entries)?;
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Validate => {
                let config = CliConfig::load(&cli.config)?;
                println!(
                    "{}: valid ({} demo agent(s))",
                    cli.config.display(),
                    config.agents.len()
                );
            }
        },
    }

    Ok(())
}

async fn run_job(
    config: CliConfig,
    job_path: &Path,
    auto_approve: bool,
    prompt_timeout: u64,
    json: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(job_path)
        .with_context(|| format!("Failed to read job file '{}'", job_path.display()))?;
    let request: JobRequest = toml::from_str(&text)
        .with_context(|| format!("Invalid job file '{}'", job_path.display()))?;
    if config.agents.is_empty() {
        bail!("no agents configured: add [[agents]] entries to the config file");
    }

    let builder = Orchestrator::builder(config.engine);
    let orchestrator = if auto_approve {
        builder.approval_channel(Arc::new(AutoApproveChannel))
    } else {
        builder.approval_channel(Arc::new(StdinApprovalChannel::new(Duration::from_secs(
            prompt_timeout,
        ))))
    }
    .build()?;

    for agent in config.agents {
        let descriptor = AgentDescriptor::new(agent.id.clone(), agent.capabilities.clone())
            .with_concurrency_limit(agent.concurrency_limit);
        orchestrator.register_agent(descriptor, Arc::new(DemoAgent::new(agent)))?;
    }

    let ticket = orchestrator.submit(request)?;
    info!(job_id = %ticket.job_id, "Job running, Ctrl-C cancels");
    let report = tokio::select! {
        report = orchestrator.wait(ticket.job_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel(ticket.job_id, "interrupted")?;
            orchestrator.wait(ticket.job_id).await?
        }
    };
    orchestrator.audit().flush().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    println!("{} ({} ms)", report.summary, report.duration_ms);
    for s in &report.subtasks {
        let tier = s.tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        let score = s
            .score
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<20} {:<10} agent={} attempts={} tier={tier} score={score}",
            s.name,
            s.status.to_string(),
            s.agent.as_deref().unwrap_or("-"),
            s.attempts,
        );
        if let Some(reason) = status_reason(&s.status) {
            println!("  {:<20} {reason}", "");
        }
    }
    println!("\nAudit entries for this job: {}", report.audit_trail.len());
}

fn status_reason(status: &SubtaskStatus) -> Option<&str> {
    match status {
        SubtaskStatus::Failed { reason } | SubtaskStatus::Rejected { reason } => {
            Some(reason.as_str())
        }
        _ => None,
    }
}
