//! Copy and fill orchestration
//!
//! Decides how a transfer runs:
//!
//! | source / destination              | path                               |
//! |-----------------------------------|------------------------------------|
//! | host-visible on both sides        | direct memmove                     |
//! | tracked device memory involved    | blit engine that can address both  |
//! | raw user pointer + device memory  | pin the user pages, else stage     |
//!
//! Host-visible means untracked (plain process memory) or carved from a
//! host-accessible region.

use crate::agent::{Agent, AgentId};
use crate::allocation::{AllocationInfo, AllocationTracker};
use crate::blit::Direction;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::region::MemoryRegion;
use crate::registry::Registry;
use crate::signal::{Signal, SignalCondition};
use hsa_tracing::{perf_event, perf_span};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Borrowed view of the session pieces a transfer needs
pub(crate) struct CopyOrchestrator<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) tracker: &'a AllocationTracker,
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) host_agent: AgentId,
    pub(crate) blit_agent: AgentId,
    /// Fine-grained system region staging buffers are carved from
    pub(crate) staging_region: &'a MemoryRegion,
}

impl CopyOrchestrator<'_> {
    /// Whether `agent` can directly address the memory at `addr`.
    pub(crate) fn can_address(&self, agent: &Agent, addr: usize) -> bool {
        match self.tracker.lookup(addr) {
            // Plain process memory lives in the shared virtual address space.
            None => true,
            Some(info) => self.can_address_allocation(agent, &info),
        }
    }

    fn can_address_allocation(&self, agent: &Agent, info: &AllocationInfo) -> bool {
        let owner = info.region.owner();
        if owner == agent.id() || info.access.contains(&agent.id()) {
            return true;
        }
        if info.owner.is_some() {
            return false;
        }
        if info.region.is_host_accessible() || owner == self.host_agent {
            return true;
        }
        self.registry
            .agent(owner)
            .map(|owner| agent.is_linked_to(owner.node_id()))
            .unwrap_or(false)
    }

    /// Blocking copy between any two addresses.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub(crate) unsafe fn copy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        check_non_null(dst, src)?;

        let dst_info = self.checked_lookup(dst as usize, size)?;
        let src_info = self.checked_lookup(src as usize, size)?;
        let dst_device = dst_info.as_ref().is_some_and(is_device_memory);
        let src_device = src_info.as_ref().is_some_and(is_device_memory);

        let _span = perf_span!("copy_memory", bytes = size);
        match (dst_info, src_info) {
            (Some(dst_info), Some(src_info)) if dst_device || src_device => {
                let agent = self.select_engine(
                    &[src_info.region.owner(), dst_info.region.owner(), self.blit_agent],
                    dst as usize,
                    src as usize,
                )?;
                blocking_copy(&agent, dst, src, size, Direction::between(src_device, dst_device), self.config)
            }
            (Some(_), None) if dst_device => self.copy_host_alloc(dst, src, size, false),
            (None, Some(_)) if src_device => self.copy_host_alloc(dst, src, size, true),
            _ => {
                ptr::copy(src, dst, size);
                Ok(())
            }
        }
    }

    /// Queue a copy that starts once every dependency signal is zero and
    /// decrements `completion` when done.
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until `completion` has been decremented.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn copy_async(
        &self,
        dst: *mut u8,
        dst_agent: AgentId,
        src: *const u8,
        src_agent: AgentId,
        size: usize,
        deps: &[Signal],
        completion: &Signal,
    ) -> Result<()> {
        if size > 0 {
            check_non_null(dst, src)?;
        }
        let dst_agent = self.registry.agent(dst_agent)?;
        let src_agent = self.registry.agent(src_agent)?;
        let dst_device = self.checked_lookup(dst as usize, size)?.as_ref().is_some_and(is_device_memory);
        let src_device = self.checked_lookup(src as usize, size)?.as_ref().is_some_and(is_device_memory);

        let mut candidates = vec![src_agent.id(), dst_agent.id()];
        if src_agent.is_host() && dst_agent.is_host() {
            candidates.push(self.blit_agent);
        }
        let agent = self
            .select_engine(&candidates, dst as usize, src as usize)
            .map_err(|_| RuntimeError::NoTransferPath {
                src: src_agent.id(),
                dst: dst_agent.id(),
            })?;

        tracing::trace!(engine = %agent.id(), size, deps = deps.len(), "submitting async copy");
        engine_of(&agent)?.submit_copy(dst, src, size, Direction::between(src_device, dst_device), deps, completion)
    }

    /// Copy between tracked device memory and a raw user pointer.
    ///
    /// `dst_malloc` marks the destination as the user pointer. The user pages
    /// are locked for the transfer when possible; otherwise the data moves
    /// through a staging buffer from the fine-grained system region.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub(crate) unsafe fn copy_host_alloc(
        &self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
        dst_malloc: bool,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        check_non_null(dst, src)?;

        let (user, device) = if dst_malloc {
            (dst as usize, src as usize)
        } else {
            (src as usize, dst as usize)
        };
        if self.tracker.lookup(user).is_some() {
            return Err(RuntimeError::invalid_argument(format!(
                "{user:#x} is a runtime allocation, not a user pointer"
            )));
        }
        let info = self
            .checked_lookup(device, size)?
            .ok_or(RuntimeError::InvalidAllocation(device))?;

        let agent = self.select_engine(&[info.region.owner(), self.blit_agent], dst as usize, src as usize)?;

        if self.config.enable_pinned_copy {
            match PinnedRange::lock(user, size) {
                Ok(_pinned) => return blocking_copy(&agent, dst, src, size, host_alloc_direction(dst_malloc), self.config),
                Err(e) => tracing::debug!(error = %e, size, "page locking failed; staging copy"),
            }
        }
        self.staged_copy(&agent, dst, src, size, dst_malloc)
    }

    unsafe fn staged_copy(&self, agent: &Agent, dst: *mut u8, src: *const u8, size: usize, dst_malloc: bool) -> Result<()> {
        let chunk = self.config.staging_buffer_size.clamp(1, size);
        let staging = StagingBuffer::new(self.staging_region, chunk)?;
        let buffer = staging.as_ptr();

        let direction = host_alloc_direction(dst_malloc);
        let mut offset = 0;
        while offset < size {
            let len = chunk.min(size - offset);
            if dst_malloc {
                blocking_copy(agent, buffer, src.add(offset), len, direction, self.config)?;
                ptr::copy_nonoverlapping(buffer, dst.add(offset), len);
            } else {
                ptr::copy_nonoverlapping(src.add(offset), buffer, len);
                blocking_copy(agent, dst.add(offset), buffer, len, direction, self.config)?;
            }
            perf_event!("staging_chunk", bytes = len, offset = offset);
            offset += len;
        }
        Ok(())
    }

    /// Write `count` 32-bit words of `value` at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for `count` words.
    pub(crate) unsafe fn fill(&self, dst: *mut u32, value: u32, count: usize) -> Result<()> {
        if dst.is_null() {
            return Err(RuntimeError::invalid_argument("fill target is null"));
        }
        let addr = dst as usize;
        if addr % std::mem::align_of::<u32>() != 0 {
            return Err(RuntimeError::invalid_argument(format!(
                "fill target {addr:#x} is not 4-byte aligned"
            )));
        }
        if count == 0 {
            return Ok(());
        }
        let bytes = count
            .checked_mul(std::mem::size_of::<u32>())
            .ok_or_else(|| RuntimeError::invalid_argument("fill size overflows"))?;

        let _span = perf_span!("fill_memory", words = count);
        match self.checked_lookup(addr, bytes)? {
            Some(info) if is_device_memory(&info) => {
                let agent = self
                    .select_engine(&[info.region.owner(), self.blit_agent], addr, addr)
                    .map_err(|_| RuntimeError::AccessDenied {
                        agent: self.host_agent,
                        addr,
                    })?;
                let completion = Signal::new(1);
                engine_of(&agent)?.submit_fill(dst, value, count, &[], &completion)?;
                wait_for_completion(&completion, self.config);
                Ok(())
            }
            _ => {
                std::slice::from_raw_parts_mut(dst, count).fill(value);
                Ok(())
            }
        }
    }

    /// First candidate with an engine that can address both addresses.
    fn select_engine(&self, candidates: &[AgentId], dst: usize, src: usize) -> Result<Arc<Agent>> {
        for id in candidates {
            let agent = self.registry.agent(*id)?;
            if agent.is_blit_capable() && self.can_address(&agent, dst) && self.can_address(&agent, src) {
                return Ok(agent);
            }
        }
        let src_owner = self.owner_of(src);
        let dst_owner = self.owner_of(dst);
        Err(RuntimeError::NoTransferPath {
            src: src_owner,
            dst: dst_owner,
        })
    }

    fn owner_of(&self, addr: usize) -> AgentId {
        self.tracker
            .lookup(addr)
            .map(|info| info.region.owner())
            .unwrap_or(self.host_agent)
    }

    fn checked_lookup(&self, addr: usize, size: usize) -> Result<Option<AllocationInfo>> {
        match self.tracker.lookup(addr) {
            Some(info) if !info.contains_range(addr, size) => Err(info.out_of_bounds(addr, size)),
            other => Ok(other),
        }
    }
}

fn is_device_memory(info: &AllocationInfo) -> bool {
    !info.region.is_host_accessible()
}

fn host_alloc_direction(dst_malloc: bool) -> Direction {
    if dst_malloc {
        Direction::DeviceToHost
    } else {
        Direction::HostToDevice
    }
}

fn check_non_null(dst: *mut u8, src: *const u8) -> Result<()> {
    if dst.is_null() || src.is_null() {
        return Err(RuntimeError::invalid_argument("copy endpoint is null"));
    }
    Ok(())
}

fn engine_of(agent: &Agent) -> Result<&crate::blit::BlitEngine> {
    agent
        .blit_engine()
        .ok_or_else(|| RuntimeError::driver(format!("{} has no blit engine", agent.id())))
}

unsafe fn blocking_copy(
    agent: &Agent,
    dst: *mut u8,
    src: *const u8,
    size: usize,
    direction: Direction,
    config: &RuntimeConfig,
) -> Result<()> {
    let completion = Signal::new(1);
    engine_of(agent)?.submit_copy(dst, src, size, direction, &[], &completion)?;
    wait_for_completion(&completion, config);
    Ok(())
}

fn wait_for_completion(completion: &Signal, config: &RuntimeConfig) {
    completion.wait_sliced(SignalCondition::Lt, 1, None, config.wait_slice());
}

// ================================================================================================
// Pinning and staging
// ================================================================================================

/// Page-locked user range, unlocked on drop.
///
/// `mlock` is not reference counted: overlapping pins share pages and the
/// first guard dropped unlocks them.
#[derive(Debug)]
struct PinnedRange {
    start: usize,
    len: usize,
}

impl PinnedRange {
    #[cfg(unix)]
    fn lock(addr: usize, size: usize) -> io::Result<Self> {
        let page = page_size();
        let start = addr & !(page - 1);
        let end = addr
            .checked_add(size)
            .and_then(|end| end.checked_add(page - 1))
            .map(|end| end & !(page - 1))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range overflows the address space"))?;
        let len = end - start;

        // SAFETY: mlock only changes residency; it fails for unmapped ranges.
        let rc = unsafe { libc::mlock(start as *const libc::c_void, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { start, len })
    }

    #[cfg(not(unix))]
    fn lock(_addr: usize, _size: usize) -> io::Result<Self> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "page locking is unavailable"))
    }
}

impl Drop for PinnedRange {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: the range was locked by `lock`.
        unsafe {
            if libc::munlock(self.start as *const libc::c_void, self.len) != 0 {
                tracing::warn!(error = %io::Error::last_os_error(), "munlock failed");
            }
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Scratch buffer carved from a host-accessible region
struct StagingBuffer<'a> {
    region: &'a MemoryRegion,
    ptr: NonNull<u8>,
    size: usize,
}

impl<'a> StagingBuffer<'a> {
    fn new(region: &'a MemoryRegion, size: usize) -> Result<Self> {
        let ptr = region.allocate(size)?;
        Ok(Self { region, ptr, size })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: allocated from this region with this size in `new`.
        unsafe { self.region.free(self.ptr, self.size) };
    }
}
