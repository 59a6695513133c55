use chrono::{Duration, Utc};
use muster_core::{Agent, AgentSpec, AgentStatus, Capability, MusterError, MusterResult};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tracks agent identity, capability sets, liveness, and status.
///
/// The registry exclusively owns [`Agent`] records; every other component
/// refers to agents by identifier and resolves through a lookup here.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an agent and returns its identifier.
    ///
    /// A caller-supplied identifier that is already present fails with
    /// [`MusterError::DuplicateAgent`]; absent one, a fresh UUID is used.
    pub async fn register(&self, spec: AgentSpec) -> MusterResult<String> {
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(MusterError::DuplicateAgent(id));
        }
        agents.insert(id.clone(), Agent::new(id.clone(), spec.capabilities));
        tracing::info!(agent_id = %id, "Agent registered");
        Ok(id)
    }

    /// Removes an agent, returning its final record.
    pub async fn deregister(&self, id: &str) -> MusterResult<Agent> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .remove(id)
            .ok_or_else(|| MusterError::UnknownAgent(id.to_string()))?;
        tracing::info!(agent_id = %id, "Agent deregistered");
        Ok(agent)
    }

    /// Records a liveness signal. An offline agent re-enters rotation idle.
    pub async fn heartbeat(&self, id: &str) -> MusterResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownAgent(id.to_string()))?;
        agent.last_heartbeat = Utc::now();
        if agent.status == AgentStatus::Offline {
            agent.status = AgentStatus::Idle;
            tracing::info!(agent_id = %id, "Agent back online");
        }
        Ok(())
    }

    /// Identifiers of idle agents whose capability set satisfies `required`,
    /// ordered by identifier. Empty when no agent matches; never an error.
    pub async fn find(&self, required: &[Capability]) -> Vec<String> {
        let agents = self.agents.read().await;
        let mut ids: Vec<String> = agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.can_run(required))
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Picks the eligible idle agent with the oldest last assignment
    /// (never-assigned agents first), spreading load across the pool.
    pub async fn pick(&self, required: &[Capability]) -> Option<String> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.can_run(required))
            .min_by(|a, b| {
                a.last_assigned
                    .cmp(&b.last_assigned)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|a| a.id.clone())
    }

    /// Whether any registered agent, in any status, satisfies `required`.
    pub async fn any_capable(&self, required: &[Capability]) -> bool {
        let agents = self.agents.read().await;
        agents.values().any(|a| a.can_run(required))
    }

    /// Sets an agent's status.
    pub async fn mark(&self, id: &str, status: AgentStatus) -> MusterResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownAgent(id.to_string()))?;
        agent.status = status;
        Ok(())
    }

    /// Marks an agent busy and stamps its last assignment time.
    pub async fn record_assignment(&self, id: &str) -> MusterResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownAgent(id.to_string()))?;
        agent.status = AgentStatus::Busy;
        agent.last_assigned = Some(Utc::now());
        Ok(())
    }

    /// Retrieves an agent record by identifier.
    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().await.get(id).cloned()
    }

    /// Marks agents offline whose heartbeat age exceeds `timeout` and
    /// returns the identifiers that changed in this sweep.
    pub async fn sweep(&self, timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now() - timeout;
        let mut agents = self.agents.write().await;
        let mut newly_offline = Vec::new();
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.last_heartbeat < cutoff {
                agent.status = AgentStatus::Offline;
                newly_offline.push(agent.id.clone());
            }
        }
        newly_offline.sort();
        for id in &newly_offline {
            tracing::warn!(agent_id = %id, "Agent heartbeat silent, marked offline");
        }
        newly_offline
    }

    /// All agent records, ordered by identifier.
    pub async fn snapshot(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut all: Vec<Agent> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Repopulates the table from persisted records. Restored agents start
    /// offline; a fresh heartbeat or re-registration returns them to rotation.
    pub async fn restore(&self, records: Vec<Agent>) {
        let mut agents = self.agents.write().await;
        agents.clear();
        for mut agent in records {
            agent.status = AgentStatus::Offline;
            agents.insert(agent.id.clone(), agent);
        }
    }

    /// Number of agents currently in rotation (idle or busy).
    pub async fn active_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.status != AgentStatus::Offline)
            .count()
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether no agents are registered.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
