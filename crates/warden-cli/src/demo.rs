//! Scripted agents for running job files without a model backend.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use warden_agent::SpecialistAgent;
use warden_core::{WardenError, WardenResult};

/// One `[[agents]]` entry of the CLI config.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoAgentConfig {
    pub id: String,
    /// Capability tags to register.
    pub capabilities: Vec<String>,
    /// Defaults to one.
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    /// Simulated work time per call.
    #[serde(default)]
    pub latency_ms: u64,
    /// Number of initial calls that fail transiently.
    #[serde(default)]
    pub fail_first: u32,
    /// Every call fails permanently.
    #[serde(default)]
    pub broken: bool,
    /// Fixed output. When unset the agent echoes what it was given.
    #[serde(default)]
    pub output: Option<Value>,
}

fn default_concurrency() -> usize {
    1
}

/// Agent whose behavior is fully described by a [`DemoAgentConfig`].
pub struct DemoAgent {
    config: DemoAgentConfig,
    calls: AtomicU32,
}

impl DemoAgent {
    /// An agent that has not been called yet.
    pub fn new(config: DemoAgentConfig) -> Self {
        Self {
            config,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SpecialistAgent for DemoAgent {
    async fn execute(&self, capability: &str, payload: &Value) -> WardenResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if self.config.broken {
            return Err(WardenError::Execution(format!(
                "{} cannot perform {capability}",
                self.config.id
            )));
        }
        if call <= self.config.fail_first {
            return Err(WardenError::TransientExecution(format!(
                "{} busy (call {call})",
                self.config.id
            )));
        }
        if let Some(output) = &self.config.output {
            return Ok(output.clone());
        }

        let upstream: Vec<&String> = payload["upstream"]
            .as_object()
            .map(|m| m.keys().collect())
            .unwrap_or_default();
        Ok(json!({
            "agent": self.config.id,
            "capability": capability,
            "subtask": payload["subtask"],
            "input": payload["input"],
            "upstream": upstream,
        }))
    }
}
