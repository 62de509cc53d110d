//! Compute agents: the host CPU and accelerator devices

use crate::blit::BlitEngine;
use crate::region::RegionId;
use std::fmt;

/// Identifier of an agent within a runtime session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u32);

impl AgentId {
    /// Create a new agent id
    pub const fn new(id: u32) -> Self {
        AgentId(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent{}", self.0)
    }
}

/// Kind of hardware behind an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => f.write_str("cpu"),
            DeviceType::Gpu => f.write_str("gpu"),
        }
    }
}

/// A compute-capable entity exposed by the platform.
///
/// Agents are created while the runtime loads and are immutable afterwards,
/// except for their blit engine, which is drained during unload.
pub struct Agent {
    id: AgentId,
    node_id: u32,
    device_type: DeviceType,
    name: String,
    regions: Vec<RegionId>,
    peers: Vec<u32>,
    blit: Option<BlitEngine>,
}

impl Agent {
    pub(crate) fn new(
        id: AgentId,
        node_id: u32,
        device_type: DeviceType,
        name: impl Into<String>,
        regions: Vec<RegionId>,
        peers: Vec<u32>,
        blit: Option<BlitEngine>,
    ) -> Self {
        Self {
            id,
            node_id,
            device_type,
            name: name.into(),
            regions,
            peers,
            blit,
        }
    }

    /// Agent identifier
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Driver node backing this agent
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Hardware kind
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Whether this is the host CPU
    pub fn is_host(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }

    /// Marketing or driver name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Regions owned by this agent, in registration order
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    /// Whether the agent has a direct link to `node_id` (or is that node)
    pub fn is_linked_to(&self, node_id: u32) -> bool {
        self.node_id == node_id || self.peers.contains(&node_id)
    }

    /// Whether the agent can drive asynchronous transfers
    pub fn is_blit_capable(&self) -> bool {
        self.blit.is_some()
    }

    pub(crate) fn blit_engine(&self) -> Option<&BlitEngine> {
        self.blit.as_ref()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("device_type", &self.device_type)
            .field("name", &self.name)
            .field("regions", &self.regions)
            .field("peers", &self.peers)
            .field("blit", &self.blit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id() {
        let id = AgentId::new(3);
        assert_eq!(id.id(), 3);
        assert_eq!(id.to_string(), "agent3");
    }

    #[test]
    fn test_agent_links() {
        let agent = Agent::new(
            AgentId::new(1),
            4,
            DeviceType::Gpu,
            "gfx-virtual",
            vec![RegionId::new(2)],
            vec![5],
            None,
        );
        assert!(!agent.is_host());
        assert!(agent.is_linked_to(4));
        assert!(agent.is_linked_to(5));
        assert!(!agent.is_linked_to(6));
        assert!(!agent.is_blit_capable());
        assert_eq!(agent.regions(), &[RegionId::new(2)]);
        assert_eq!(agent.device_type().to_string(), "gpu");
    }
}
