//! Error types for runtime operations

use crate::agent::AgentId;
use crate::region::RegionId;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors reported by the runtime core
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime has not been acquired (or was fully released)
    #[error("runtime is not initialized")]
    NotInitialized,

    /// Opening, closing or querying the driver session failed
    #[error("driver error: {0}")]
    Driver(String),

    /// The driver reported a topology without any usable agent
    #[error("driver reported no agents")]
    NoAgents,

    /// Address is not the base of a live allocation owned by this runtime
    #[error("address {0:#x} is not a live allocation")]
    InvalidAllocation(usize),

    /// Unknown agent identifier
    #[error("invalid agent: {0}")]
    InvalidAgent(AgentId),

    /// Unknown region identifier
    #[error("invalid memory region: {0}")]
    InvalidRegion(RegionId),

    /// Unknown system attribute key
    #[error("unknown system attribute: {0:#x}")]
    UnknownAttribute(u32),

    /// Region or staging resources exhausted
    #[error("out of resources: requested {requested} bytes, {available} available")]
    OutOfResources { requested: usize, available: usize },

    /// Access outside a tracked allocation
    #[error("access out of bounds: {addr:#x} + {size} exceeds allocation of {allocation_size} bytes")]
    OutOfBounds {
        addr: usize,
        size: usize,
        allocation_size: usize,
    },

    /// No agent involved in an asynchronous copy can address both sides
    #[error("no transfer path between {src} and {dst}")]
    NoTransferPath { src: AgentId, dst: AgentId },

    /// Agent is not allowed to access the given address
    #[error("{agent} cannot access {addr:#x}")]
    AccessDenied { agent: AgentId, addr: usize },

    /// An extension or tool module failed to load
    #[error("module '{name}' failed to load: {reason}")]
    ModuleLoad { name: String, reason: String },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RuntimeError {
    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a module load error
    pub fn module_load(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ModuleLoad {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
