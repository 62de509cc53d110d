//! Driver boundary
//!
//! The runtime talks to the platform through the [`Driver`] trait: open a
//! session, read the node topology, close the session. Everything else
//! (agents, regions, engines) is built by the runtime from that topology.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Runtime (Load)               │
//! │  open() → topology() → agents + regions      │
//! └──────────────────────┬───────────────────────┘
//!                        │
//!              ┌─────────┴─────────┐
//!              ▼                   ▼
//!       ┌─────────────┐     ┌─────────────┐
//!       │   Virtual   │     │   Kernel    │
//!       │   Driver    │     │   Driver    │
//!       └─────────────┘     └─────────────┘
//! ```
//!
//! [`VirtualDriver`] is the reference implementation. It describes a host CPU
//! node plus any number of GPU nodes whose memory is backed by host RAM.

use crate::agent::DeviceType;
use crate::error::{Result, RuntimeError};
use crate::region::Segment;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Timestamp frequency reported by the virtual driver (nanosecond ticks)
pub const VIRTUAL_TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

/// A bank of memory attached to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBank {
    pub segment: Segment,
    pub size: usize,
    pub host_accessible: bool,
}

impl MemoryBank {
    /// Host system memory
    pub fn system(size: usize) -> Self {
        Self {
            segment: Segment::System,
            size,
            host_accessible: true,
        }
    }

    /// Device-local memory
    pub fn local(size: usize, host_accessible: bool) -> Self {
        Self {
            segment: Segment::Local,
            size,
            host_accessible,
        }
    }
}

/// Properties of one topology node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProperties {
    pub node_id: u32,
    pub device_type: DeviceType,
    pub name: String,
    pub memory_banks: Vec<MemoryBank>,
    /// Nodes reachable over a direct link
    pub peers: Vec<u32>,
    /// Node has a DMA engine able to run asynchronous copies
    pub has_dma: bool,
}

/// Snapshot of the platform reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub nodes: Vec<NodeProperties>,
    pub svm_start: u64,
    pub svm_end: u64,
    pub timestamp_frequency: u64,
}

/// Privileged driver session
///
/// Implementations must be safe to share between threads; the runtime calls
/// `open`/`close` only from its bootstrap path.
pub trait Driver: Send + Sync {
    /// Open the driver session
    fn open(&self) -> Result<()>;

    /// Close the driver session
    fn close(&self) -> Result<()>;

    /// Enumerate the platform. Only valid while the session is open.
    fn topology(&self) -> Result<Topology>;

    /// Current system timestamp in ticks of `Topology::timestamp_frequency`
    fn timestamp(&self) -> u64;
}

// ================================================================================================
// Virtual driver
// ================================================================================================

/// In-process driver exposing a virtual topology.
#[derive(Debug)]
pub struct VirtualDriver {
    topology: Topology,
    fail_open: bool,
    is_open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    epoch: Instant,
}

impl VirtualDriver {
    /// One CPU with 1 GiB of system memory and one DMA-capable GPU with
    /// 256 MiB of device-local memory.
    pub fn new() -> Self {
        Self::builder().gpu(256 << 20, false).build()
    }

    /// Start describing a custom topology
    pub fn builder() -> VirtualDriverBuilder {
        VirtualDriverBuilder::default()
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Number of successful `close` calls
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Whether a session is currently open
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for VirtualDriver {
    fn open(&self) -> Result<()> {
        if self.fail_open {
            return Err(RuntimeError::driver("virtual driver configured to refuse open"));
        }
        if self.is_open.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::driver("session already open"));
        }
        self.opens.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(nodes = self.topology.nodes.len(), "virtual driver opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Err(RuntimeError::driver("session not open"));
        }
        self.closes.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("virtual driver closed");
        Ok(())
    }

    fn topology(&self) -> Result<Topology> {
        if !self.is_open() {
            return Err(RuntimeError::driver("session not open"));
        }
        Ok(self.topology.clone())
    }

    fn timestamp(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Builder for [`VirtualDriver`]
#[derive(Debug, Clone)]
pub struct VirtualDriverBuilder {
    system_memory: usize,
    gpus: Vec<NodeProperties>,
    fail_open: bool,
    empty: bool,
}

impl Default for VirtualDriverBuilder {
    fn default() -> Self {
        Self {
            system_memory: 1 << 30,
            gpus: Vec::new(),
            fail_open: false,
            empty: false,
        }
    }
}

impl VirtualDriverBuilder {
    /// Size of the host node's system memory
    pub fn system_memory(mut self, size: usize) -> Self {
        self.system_memory = size;
        self
    }

    /// Add a DMA-capable GPU node with `local_memory` bytes of device memory
    pub fn gpu(self, local_memory: usize, host_accessible: bool) -> Self {
        self.gpu_node(local_memory, host_accessible, true)
    }

    /// Add a GPU node without a DMA engine
    pub fn gpu_without_dma(self, local_memory: usize, host_accessible: bool) -> Self {
        self.gpu_node(local_memory, host_accessible, false)
    }

    /// Link two GPU nodes (node ids start at 1; node 0 is the CPU)
    pub fn peer_link(mut self, a: u32, b: u32) -> Self {
        for gpu in &mut self.gpus {
            if gpu.node_id == a && !gpu.peers.contains(&b) {
                gpu.peers.push(b);
            }
            if gpu.node_id == b && !gpu.peers.contains(&a) {
                gpu.peers.push(a);
            }
        }
        self
    }

    /// Make every `open` call fail
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Report a topology without any node
    pub fn no_agents(mut self) -> Self {
        self.empty = true;
        self
    }

    pub fn build(self) -> VirtualDriver {
        let nodes = if self.empty {
            Vec::new()
        } else {
            let cpu = NodeProperties {
                node_id: 0,
                device_type: DeviceType::Cpu,
                name: "CPU Virtual Device".to_string(),
                memory_banks: vec![MemoryBank::system(self.system_memory)],
                peers: Vec::new(),
                has_dma: false,
            };
            std::iter::once(cpu).chain(self.gpus).collect()
        };

        VirtualDriver {
            topology: Topology {
                nodes,
                svm_start: 0x1_0000_0000,
                svm_end: 0x7fff_ffff_ffff,
                timestamp_frequency: VIRTUAL_TIMESTAMP_FREQUENCY,
            },
            fail_open: self.fail_open,
            is_open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    fn gpu_node(mut self, local_memory: usize, host_accessible: bool, has_dma: bool) -> Self {
        let node_id = self.gpus.len() as u32 + 1;
        self.gpus.push(NodeProperties {
            node_id,
            device_type: DeviceType::Gpu,
            name: format!("GPU Virtual Device {node_id}"),
            memory_banks: vec![MemoryBank::local(local_memory, host_accessible)],
            peers: Vec::new(),
            has_dma,
        });
        self
    }
}
