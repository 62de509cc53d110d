//! Agent and memory-region registries
//!
//! Both collections are filled once while the runtime loads and read
//! afterwards. Insertion order is iteration order.

use crate::agent::{Agent, AgentId};
use crate::error::{Result, RuntimeError};
use crate::region::{MemoryRegion, RegionId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Ordered agent and region collections owned by a runtime session
#[derive(Debug, Default)]
pub struct Registry {
    agents: RwLock<Vec<Arc<Agent>>>,
    regions: RwLock<Vec<Arc<MemoryRegion>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_agent(&self, agent: Agent) -> Arc<Agent> {
        let agent = Arc::new(agent);
        tracing::debug!(
            agent = %agent.id(),
            node = agent.node_id(),
            device = %agent.device_type(),
            "registered agent"
        );
        self.agents.write().push(Arc::clone(&agent));
        agent
    }

    pub(crate) fn register_memory_region(&self, region: MemoryRegion) -> Arc<MemoryRegion> {
        let region = Arc::new(region);
        tracing::debug!(
            region = %region.id(),
            owner = %region.owner(),
            capacity = region.capacity(),
            "registered memory region"
        );
        self.regions.write().push(Arc::clone(&region));
        region
    }

    /// Visit every agent in registration order.
    ///
    /// Stops at the first callback error and returns it.
    pub fn iterate_agents<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Arc<Agent>) -> Result<()>,
    {
        let agents = self.agents.read().clone();
        agents.iter().try_for_each(|agent| callback(agent))
    }

    /// Visit every region owned by `agent` in registration order.
    pub fn iterate_regions<F>(&self, agent: AgentId, mut callback: F) -> Result<()>
    where
        F: FnMut(&Arc<MemoryRegion>) -> Result<()>,
    {
        let agent = self.agent(agent)?;
        for id in agent.regions() {
            callback(&self.region(*id)?)?;
        }
        Ok(())
    }

    /// Look up an agent by id
    pub fn agent(&self, id: AgentId) -> Result<Arc<Agent>> {
        self.agents
            .read()
            .iter()
            .find(|agent| agent.id() == id)
            .cloned()
            .ok_or(RuntimeError::InvalidAgent(id))
    }

    /// Look up a region by id
    pub fn region(&self, id: RegionId) -> Result<Arc<MemoryRegion>> {
        self.regions
            .read()
            .iter()
            .find(|region| region.id() == id)
            .cloned()
            .ok_or(RuntimeError::InvalidRegion(id))
    }

    /// Snapshot of all agents
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.agents.read().clone()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Drop every region. Allocations must already be released.
    pub(crate) fn destroy_memory_regions(&self) {
        let regions = std::mem::take(&mut *self.regions.write());
        for region in &regions {
            if region.used() != 0 {
                tracing::warn!(region = %region.id(), used = region.used(), "destroying region with live allocations");
            }
        }
        tracing::debug!(count = regions.len(), "destroyed memory regions");
    }

    /// Drop every agent. Blit engines must already be drained.
    pub(crate) fn destroy_agents(&self) {
        let agents = std::mem::take(&mut *self.agents.write());
        tracing::debug!(count = agents.len(), "destroyed agents");
    }
}
