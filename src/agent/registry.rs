//! Agent registry
//!
//! Thread-safe lookup of managed agents by id and by declared capability.
//! Registrations may change at any time; the orchestrator resolves agents
//! once at the start of a run.

use super::contract::ManagedAgent;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Thread-safe registry of managed agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<ManagedAgent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ManagedAgent>>> {
        self.agents.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ManagedAgent>>> {
        self.agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register or replace an agent; returns the agent it replaced, if any
    pub fn register_agent(&self, agent: Arc<ManagedAgent>) -> Option<Arc<ManagedAgent>> {
        let agent_id = agent.id().to_string();
        let previous = self.write().insert(agent_id.clone(), agent);
        if previous.is_none() {
            info!("Registered new agent: {}", agent_id);
        } else {
            debug!("Replaced agent registration: {}", agent_id);
        }
        previous
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Option<Arc<ManagedAgent>> {
        let removed = self.write().remove(agent_id);
        if removed.is_some() {
            info!("Unregistered agent: {}", agent_id);
        }
        removed
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<ManagedAgent>> {
        self.read().get(agent_id).cloned()
    }

    /// All registered agents, ordered by id
    pub fn get_available_agents(&self) -> Vec<Arc<ManagedAgent>> {
        let mut agents: Vec<_> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    /// Agents declaring `capability` (case-insensitive), highest priority
    /// first, ties broken by id
    pub fn get_agents_by_capability(&self, capability: &str) -> Vec<Arc<ManagedAgent>> {
        let priority_of = |agent: &ManagedAgent| {
            agent
                .metadata()
                .capabilities
                .iter()
                .filter(|c| c.name.eq_ignore_ascii_case(capability))
                .map(|c| c.priority)
                .max()
        };

        let mut candidates: Vec<(u32, Arc<ManagedAgent>)> = self
            .read()
            .values()
            .filter_map(|agent| priority_of(agent).map(|p| (p, Arc::clone(agent))))
            .collect();

        candidates.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then_with(|| a.id().cmp(b.id())));
        candidates.into_iter().map(|(_, agent)| agent).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.read().len()
    }
}
