//! C1 — Instance Registry: name resolution from a logical `agentId` to its
//! currently online instances.
//!
//! Grounded on the agent-registry pattern used elsewhere in this codebase
//! (`DashMap` keyed for O(1) lookup, capability indexing kept in a
//! secondary map), generalized to agent *instances* rather than a single
//! local agent record per id.

use crate::domain_types::AgentId;
use crate::hub::domain_types::{AgentInstance, InstanceId, SessionId};
use crate::hub::traits::InstanceRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, info};

/// The default, in-memory [`InstanceRegistry`] implementation.
pub struct InstanceRegistryImpl {
    instances: DashMap<(AgentId, InstanceId), AgentInstance>,
}

impl Default for InstanceRegistryImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistryImpl {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Total number of known instances, online or not. Exposed for the
    /// facade's `stats()`.
    #[must_use]
    pub fn known_instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Snapshot of every known instance, for `stats()`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentInstance> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl InstanceRegistry for InstanceRegistryImpl {
    async fn register(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        capabilities: HashSet<String>,
        session_id: Option<SessionId>,
    ) {
        debug!(%agent_id, %instance_id, "registering instance");
        let instance = AgentInstance::new(
            agent_id.clone(),
            instance_id.clone(),
            capabilities,
            session_id,
        );
        self.instances.insert((agent_id, instance_id), instance);
    }

    async fn mark_offline(&self, agent_id: AgentId, instance_id: InstanceId) {
        if let Some(mut entry) = self
            .instances
            .get_mut(&(agent_id.clone(), instance_id.clone()))
        {
            entry.online = false;
            info!(%agent_id, %instance_id, "instance marked offline");
        }
    }

    async fn live_instances(&self, agent_id: AgentId) -> Vec<AgentInstance> {
        let mut live: Vec<AgentInstance> = self
            .instances
            .iter()
            .filter(|e| e.key().0 == agent_id && e.value().online)
            .map(|e| e.value().clone())
            .collect();
        live.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        live
    }

    async fn all_live_agent_ids(&self) -> HashSet<AgentId> {
        self.instances
            .iter()
            .filter(|e| e.value().online)
            .map(|e| e.key().0.clone())
            .collect()
    }

    async fn touch(&self, agent_id: AgentId, instance_id: InstanceId) {
        if let Some(mut entry) = self.instances.get_mut(&(agent_id, instance_id)) {
            entry.last_seen = crate::hub::domain_types::Timestamp::now();
        }
    }
}
