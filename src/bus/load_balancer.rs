//! Round-robin selection across interchangeable agent instances

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct InstancePool {
    instances: Vec<String>,
    next: usize,
}

/// Round-robin pointer per logical agent id
#[derive(Debug, Clone, Default)]
pub struct LoadBalancer {
    pools: Arc<Mutex<HashMap<String, InstancePool>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InstancePool>> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an instance; registering the same instance twice is a no-op
    pub fn register_instance(&self, agent_id: &str, instance_id: &str) -> bool {
        let mut pools = self.lock();
        let pool = pools.entry(agent_id.to_string()).or_default();
        if pool.instances.iter().any(|i| i == instance_id) {
            return false;
        }
        pool.instances.push(instance_id.to_string());
        debug!(agent_id = %agent_id, instance_id = %instance_id, "Registered agent instance");
        true
    }

    pub fn unregister_instance(&self, agent_id: &str, instance_id: &str) -> bool {
        let mut pools = self.lock();
        let Some(pool) = pools.get_mut(agent_id) else {
            return false;
        };
        let Some(index) = pool.instances.iter().position(|i| i == instance_id) else {
            return false;
        };
        pool.instances.remove(index);
        if index < pool.next {
            pool.next -= 1;
        }
        if pool.instances.is_empty() {
            pools.remove(agent_id);
        }
        true
    }

    /// Next instance for `agent_id`, or `None` when none are registered
    pub fn next_instance(&self, agent_id: &str) -> Option<String> {
        let mut pools = self.lock();
        let pool = pools.get_mut(agent_id)?;
        if pool.instances.is_empty() {
            return None;
        }
        let index = pool.next % pool.instances.len();
        pool.next = (index + 1) % pool.instances.len();
        Some(pool.instances[index].clone())
    }

    pub fn instances(&self, agent_id: &str) -> Vec<String> {
        self.lock()
            .get(agent_id)
            .map(|p| p.instances.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new();
        lb.register_instance("writer", "w1");
        lb.register_instance("writer", "w2");
        lb.register_instance("writer", "w3");

        let picks: Vec<_> = (0..6).filter_map(|_| lb.next_instance("writer")).collect();
        assert_eq!(picks, vec!["w1", "w2", "w3", "w1", "w2", "w3"]);
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        let lb = LoadBalancer::new();
        assert!(lb.register_instance("a", "a1"));
        assert!(!lb.register_instance("a", "a1"));
        assert_eq!(lb.instances("a"), vec!["a1"]);
    }

    #[test]
    fn test_unknown_agent_has_no_instance() {
        assert!(LoadBalancer::new().next_instance("ghost").is_none());
    }

    #[test]
    fn test_unregister_keeps_rotation() {
        let lb = LoadBalancer::new();
        lb.register_instance("a", "a1");
        lb.register_instance("a", "a2");
        lb.register_instance("a", "a3");
        assert_eq!(lb.next_instance("a").as_deref(), Some("a1"));
        assert!(lb.unregister_instance("a", "a1"));
        assert_eq!(lb.next_instance("a").as_deref(), Some("a2"));
        assert_eq!(lb.next_instance("a").as_deref(), Some("a3"));
        assert!(lb.unregister_instance("a", "a2"));
        assert!(lb.unregister_instance("a", "a3"));
        assert!(lb.next_instance("a").is_none());
    }
}
