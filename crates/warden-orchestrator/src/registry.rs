use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use warden_agent::{BreakerConfig, CircuitBreaker, CircuitState, SpecialistAgent};
use warden_core::{WardenError, WardenResult};

/// Public view of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent id.
    pub id: String,
    /// Capability tags the agent can serve.
    pub capabilities: BTreeSet<String>,
    /// Maximum in-flight subtasks for this agent.
    pub concurrency_limit: usize,
    /// Breaker state at the time of the snapshot.
    #[serde(default)]
    pub circuit_state: CircuitState,
    /// Subtasks currently running on the agent.
    #[serde(default)]
    pub in_flight: usize,
}

impl AgentDescriptor {
    /// A descriptor with a concurrency limit of one.
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            concurrency_limit: 1,
            circuit_state: CircuitState::Closed,
            in_flight: 0,
        }
    }

    /// Set the maximum number of in-flight subtasks.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Whether the agent declares `capability`.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A registry slot: the agent, its breaker and its load counters.
pub struct RegisteredAgent {
    id: String,
    capabilities: BTreeSet<String>,
    agent: Arc<dyn SpecialistAgent>,
    breaker: CircuitBreaker,
    in_flight: AtomicUsize,
    limit: AtomicUsize,
    configured_limit: usize,
}

impl RegisteredAgent {
    /// Agent id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The agent itself.
    pub fn agent(&self) -> &Arc<dyn SpecialistAgent> {
        &self.agent
    }

    /// The agent's circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Subtasks currently running on the agent.
    pub fn load(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Current concurrency limit, possibly lowered by a drift policy.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Descriptor reflecting live load and breaker state.
    pub fn snapshot(&self) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            concurrency_limit: self.limit(),
            circuit_state: self.breaker.state(),
            in_flight: self.load(),
        }
    }

    /// Take one in-flight slot if the agent is under its limit.
    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.limit() {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds one in-flight slot on an agent. Dropping it frees the slot.
pub struct AgentLease {
    agent: Arc<RegisteredAgent>,
    released: Arc<Notify>,
}

impl AgentLease {
    /// Id of the leased agent.
    pub fn id(&self) -> &str {
        self.agent.id()
    }

    /// The leased agent.
    pub fn agent(&self) -> &Arc<dyn SpecialistAgent> {
        self.agent.agent()
    }

    /// The leased agent's circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        self.agent.breaker()
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.agent.release();
        self.released.notify_waiters();
    }
}

/// Registered agents indexed by id. Safe for concurrent lookups and updates.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<RegisteredAgent>>>,
    breaker_config: BreakerConfig,
    released: Arc<Notify>,
}

impl AgentRegistry {
    /// An empty registry whose agents get breakers built from `breaker_config`.
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            breaker_config,
            released: Arc::new(Notify::new()),
        }
    }

    /// Add an agent. Ids are unique; the limit is clamped to at least one.
    pub fn register(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn SpecialistAgent>,
    ) -> WardenResult<()> {
        if descriptor.capabilities.is_empty() {
            return Err(WardenError::Config(format!(
                "agent '{}' declares no capabilities",
                descriptor.id
            )));
        }
        let mut agents = self.agents.write();
        if agents.contains_key(&descriptor.id) {
            return Err(WardenError::Config(format!(
                "agent '{}' is already registered",
                descriptor.id
            )));
        }
        let limit = descriptor.concurrency_limit.max(1);
        info!(
            agent = %descriptor.id,
            capabilities = ?descriptor.capabilities,
            limit,
            "Agent registered"
        );
        agents.insert(
            descriptor.id.clone(),
            Arc::new(RegisteredAgent {
                breaker: CircuitBreaker::new(descriptor.id.clone(), self.breaker_config.clone()),
                id: descriptor.id,
                capabilities: descriptor.capabilities,
                agent,
                in_flight: AtomicUsize::new(0),
                limit: AtomicUsize::new(limit),
                configured_limit: limit,
            }),
        );
        Ok(())
    }

    /// Remove an agent. In-flight leases finish normally.
    pub fn deregister(&self, id: &str) -> Option<AgentDescriptor> {
        let removed = self.agents.write().remove(id)?;
        info!(agent = %id, "Agent deregistered");
        self.released.notify_waiters();
        Some(removed.snapshot())
    }

    /// Agent by id.
    pub fn get(&self, id: &str) -> Option<Arc<RegisteredAgent>> {
        self.agents.read().get(id).cloned()
    }

    /// Agents supporting `capability`, lowest load first, ties broken by id.
    pub fn find_agents(&self, capability: &str) -> Vec<AgentDescriptor> {
        self.candidates(capability, &HashSet::new(), None)
            .iter()
            .map(|a| a.snapshot())
            .collect()
    }

    /// Whether any registered agent supports `capability`.
    pub fn knows_capability(&self, capability: &str) -> bool {
        self.agents
            .read()
            .values()
            .any(|a| a.capabilities.contains(capability))
    }

    /// Union of every registered capability.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.agents
            .read()
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect()
    }

    /// Snapshots of every agent, in id order.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        self.agents.read().values().map(|a| a.snapshot()).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Change an agent's concurrency limit (minimum one).
    pub fn set_concurrency_limit(&self, id: &str, limit: usize) -> bool {
        let Some(agent) = self.get(id) else {
            return false;
        };
        agent.limit.store(limit.max(1), Ordering::Release);
        self.released.notify_waiters();
        true
    }

    /// Put an agent back on the limit it was registered with.
    pub fn restore_concurrency_limit(&self, id: &str) -> bool {
        let Some(agent) = self.get(id) else {
            return false;
        };
        agent.limit.store(agent.configured_limit, Ordering::Release);
        self.released.notify_waiters();
        true
    }

    /// Reserve a slot on the least-loaded agent for `capability`.
    ///
    /// Waits while every candidate is at its limit. Returns `None` when no
    /// agent outside `excluded` supports the capability. `preferred`, if it
    /// is a candidate, is tried first.
    pub async fn acquire(
        &self,
        capability: &str,
        excluded: &HashSet<String>,
        preferred: Option<&str>,
    ) -> Option<AgentLease> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let candidates = self.candidates(capability, excluded, preferred);
            if candidates.is_empty() {
                return None;
            }
            if let Some(agent) = candidates.into_iter().find(|a| a.try_reserve()) {
                return Some(AgentLease {
                    agent,
                    released: self.released.clone(),
                });
            }
            notified.await;
        }
    }

    fn candidates(
        &self,
        capability: &str,
        excluded: &HashSet<String>,
        preferred: Option<&str>,
    ) -> Vec<Arc<RegisteredAgent>> {
        let mut found: Vec<Arc<RegisteredAgent>> = self
            .agents
            .read()
            .values()
            .filter(|a| a.capabilities.contains(capability) && !excluded.contains(&a.id))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            let a_pref = preferred == Some(a.id.as_str());
            let b_pref = preferred == Some(b.id.as_str());
            b_pref
                .cmp(&a_pref)
                .then(a.load().cmp(&b.load()))
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }
}
