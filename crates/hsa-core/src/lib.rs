//! # hsa-core
//!
//! Core runtime for a heterogeneous compute platform.
//!
//! The crate owns the connection to a device driver and everything built on
//! top of it for the lifetime of a session:
//!
//! - **Registries** of compute agents (host CPU, GPUs) and memory regions
//! - **Allocation tracking** keyed by base address
//! - **Signals** and an **async event monitor** dispatching signal-driven callbacks
//! - **Blit engines** and a **copy orchestrator** for host/device transfers
//! - **Runtime modules** (extensions and tools) with load/unload hooks
//!
//! ## Quick Start
//!
//! ```rust
//! use hsa_core::{HandlerAction, Signal, SignalCondition};
//! use std::sync::mpsc;
//!
//! # fn main() -> hsa_core::Result<()> {
//! hsa_core::init()?;
//! let runtime = hsa_core::runtime();
//!
//! let signal = Signal::new(1);
//! let (tx, rx) = mpsc::channel();
//! runtime.set_async_signal_handler(&signal, SignalCondition::Eq, 0, move |value| {
//!     tx.send(value).ok();
//!     HandlerAction::StopMonitoring
//! })?;
//! signal.subtract(1);
//! assert_eq!(rx.recv().ok(), Some(0));
//!
//! hsa_core::shut_down();
//! # Ok(())
//! # }
//! ```
//!
//! Explicit [`Runtime`] instances built with [`RuntimeBuilder`] over any
//! [`Driver`] are the primary form; the free functions above wrap a
//! process-wide instance backed by [`VirtualDriver`].

pub mod agent;
pub mod allocation;
pub mod blit;
pub mod config;
mod copy;
pub mod driver;
pub mod error;
pub mod events;
pub mod loader;
pub mod module;
pub mod region;
pub mod registry;
pub mod runtime;
pub mod signal;
pub mod system_info;

pub use agent::{Agent, AgentId, DeviceType};
pub use allocation::{AllocationInfo, AllocationTracker};
pub use blit::{BlitEngine, Direction};
pub use config::RuntimeConfig;
pub use driver::{Driver, MemoryBank, NodeProperties, Topology, VirtualDriver, VirtualDriverBuilder};
pub use error::{Result, RuntimeError};
pub use events::{AsyncEventMonitor, AsyncHandler, HandlerAction, MonitorState};
pub use loader::{CodeObjectHandle, CodeObjectManager, ExecutableHandle, Loader};
pub use module::{ModuleContext, ModuleFactory, ModuleKind, RuntimeModule};
pub use region::{Granularity, MemoryRegion, RegionId, Segment, REGION_ALIGNMENT};
pub use registry::Registry;
pub use runtime::{Runtime, RuntimeBuilder, Session};
pub use signal::{Signal, SignalCondition, SignalValue};
pub use system_info::{Endianness, MachineModel, SystemAttribute, SystemInfoValue};

use std::sync::{Arc, OnceLock};

static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime over the default virtual topology.
///
/// Configuration is read from the environment on first use.
pub fn runtime() -> &'static Runtime {
    GLOBAL_RUNTIME.get_or_init(|| {
        RuntimeBuilder::new(Arc::new(VirtualDriver::new()))
            .config(RuntimeConfig::from_env())
            .build()
    })
}

/// Acquire the process-wide runtime
pub fn init() -> Result<()> {
    runtime().acquire()
}

/// Release the process-wide runtime. Returns false if it was not acquired.
pub fn shut_down() -> bool {
    runtime().release()
}
