//! Memory regions: pools of addressable memory owned by agents
//!
//! A region hands out page-aligned, zeroed blocks up to its capacity. The
//! runtime designates two regions shared by every agent: a fine-grained and a
//! coarse-grained system region, both carved from host memory.

use crate::agent::AgentId;
use crate::error::{Result, RuntimeError};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment (and accounting granule) of every region allocation
pub const REGION_ALIGNMENT: usize = 4096;

/// Identifier of a memory region within a runtime session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Create a new region id
    pub const fn new(id: u32) -> Self {
        RegionId(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region{}", self.0)
    }
}

/// Where the region's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Host system memory, shared by all agents
    System,
    /// Memory local to a device
    Local,
}

/// Coherence granularity of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Coherent at fine granularity; every agent may access without grants
    Fine,
    /// Coherent only at dispatch boundaries; cross-agent access needs grants
    Coarse,
}

/// A pool of addressable memory.
#[derive(Debug)]
pub struct MemoryRegion {
    id: RegionId,
    owner: AgentId,
    segment: Segment,
    granularity: Granularity,
    capacity: usize,
    host_accessible: bool,
    used: AtomicUsize,
}

impl MemoryRegion {
    pub(crate) fn new(
        id: RegionId,
        owner: AgentId,
        segment: Segment,
        granularity: Granularity,
        capacity: usize,
        host_accessible: bool,
    ) -> Self {
        Self {
            id,
            owner,
            segment,
            granularity,
            capacity,
            host_accessible,
            used: AtomicUsize::new(0),
        }
    }

    /// Region identifier
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Agent that owns the region
    pub fn owner(&self) -> AgentId {
        self.owner
    }

    /// Memory segment
    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Coherence granularity
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Whether this is a shared system-memory region
    pub fn is_system(&self) -> bool {
        self.segment == Segment::System
    }

    /// Whether the host CPU can read and write this region directly
    pub fn is_host_accessible(&self) -> bool {
        self.host_accessible
    }

    /// Total bytes the region can hand out
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out (rounded to [`REGION_ALIGNMENT`])
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Allocate `size` bytes of zeroed memory.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero size
    /// - `OutOfResources` when the request does not fit the remaining capacity
    pub(crate) fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(RuntimeError::invalid_argument("allocation size must be non-zero"));
        }
        let granted = Self::granule(size).ok_or(RuntimeError::OutOfResources {
            requested: size,
            available: self.available(),
        })?;

        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(granted).filter(|total| *total <= self.capacity)
            })
            .map_err(|used| RuntimeError::OutOfResources {
                requested: size,
                available: self.capacity.saturating_sub(used),
            })?;

        let layout = match Layout::from_size_align(granted, REGION_ALIGNMENT) {
            Ok(layout) => layout,
            Err(e) => {
                self.used.fetch_sub(granted, Ordering::AcqRel);
                return Err(RuntimeError::invalid_argument(format!("invalid layout: {e}")));
            }
        };

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(ptr),
            None => {
                self.used.fetch_sub(granted, Ordering::AcqRel);
                Err(RuntimeError::OutOfResources {
                    requested: size,
                    available: self.available(),
                })
            }
        }
    }

    /// Return a block to the region.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`MemoryRegion::allocate`] on this region with the
    /// same `size`, and must not be used afterwards.
    pub(crate) unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let Some(granted) = Self::granule(size) else {
            return;
        };
        // allocate() validated this layout for the same size.
        let layout = Layout::from_size_align_unchecked(granted, REGION_ALIGNMENT);
        dealloc(ptr.as_ptr(), layout);
        self.used.fetch_sub(granted, Ordering::AcqRel);
    }

    /// Validate an access grant for `agents`. Only an empty list is rejected.
    pub(crate) fn allow_access(&self, agents: &[AgentId]) -> Result<()> {
        if agents.is_empty() {
            return Err(RuntimeError::invalid_argument("access list is empty"));
        }
        tracing::trace!(region = %self.id, granularity = ?self.granularity, agents = agents.len(), "access grant");
        Ok(())
    }

    fn granule(size: usize) -> Option<usize> {
        size.checked_add(REGION_ALIGNMENT - 1)
            .map(|s| s & !(REGION_ALIGNMENT - 1))
    }
}
