//! Allocation tracker
//!
//! Every address handed out by a region is recorded here, keyed by its base
//! address. The map lock is held only for map mutation; region allocate and
//! free calls run outside it.

use crate::agent::AgentId;
use crate::error::{Result, RuntimeError};
use crate::region::{MemoryRegion, RegionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Provenance of one live allocation
#[derive(Debug, Clone)]
struct AllocationRecord {
    region: Arc<MemoryRegion>,
    /// Set when access was restricted to a single agent at allocation time
    owner: Option<AgentId>,
    size: usize,
    /// Agents granted access through `allow_access`
    access: Vec<AgentId>,
}

/// Snapshot of an allocation containing some address
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    pub base: usize,
    pub size: usize,
    pub region: Arc<MemoryRegion>,
    pub owner: Option<AgentId>,
    pub access: Vec<AgentId>,
}

impl AllocationInfo {
    /// Whether `[addr, addr + size)` lies inside this allocation
    pub fn contains_range(&self, addr: usize, size: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.base + self.size)
    }

    /// Error describing an access of `size` bytes at `addr` that overruns this allocation
    pub(crate) fn out_of_bounds(&self, addr: usize, size: usize) -> RuntimeError {
        RuntimeError::OutOfBounds {
            addr,
            size,
            allocation_size: self.size,
        }
    }
}

/// Pointer-keyed ownership table for region allocations
#[derive(Debug, Default)]
pub struct AllocationTracker {
    records: Mutex<BTreeMap<usize, AllocationRecord>>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes from `region` and record the result.
    ///
    /// With `restrict_access` the allocation is owned by the region's agent
    /// and other agents need an explicit grant.
    #[tracing::instrument(skip(self, region), fields(region = %region.id()))]
    pub fn allocate(&self, region: &Arc<MemoryRegion>, size: usize, restrict_access: bool) -> Result<NonNull<u8>> {
        let start = std::time::Instant::now();
        let ptr = region.allocate(size)?;
        let owner = restrict_access.then(|| region.owner());

        let record = AllocationRecord {
            region: Arc::clone(region),
            owner,
            size,
            access: owner.into_iter().collect(),
        };

        let addr = ptr.as_ptr() as usize;
        if let Some(stale) = self.records.lock().insert(addr, record) {
            // The region just returned this address, so any record left here
            // was never freed through the tracker.
            tracing::error!(addr, size = stale.size, "replaced stale allocation record");
        }

        hsa_tracing::performance::record_allocation(
            size,
            &region.id().to_string(),
            crate::region::REGION_ALIGNMENT,
            start.elapsed().as_micros() as u64,
        );
        Ok(ptr)
    }

    /// Free an allocation by base address.
    ///
    /// Unknown addresses (including a second free of the same address) fail
    /// with `InvalidAllocation`.
    pub fn free(&self, addr: usize) -> Result<()> {
        let record = self
            .records
            .lock()
            .remove(&addr)
            .ok_or(RuntimeError::InvalidAllocation(addr))?;

        // Only the caller that removed the record reaches the region.
        if let Some(ptr) = NonNull::new(addr as *mut u8) {
            // SAFETY: the record was created from this region's allocate()
            // with the same size and has just been removed.
            unsafe { record.region.free(ptr, record.size) };
        }
        tracing::trace!(addr, size = record.size, "freed allocation");
        Ok(())
    }

    /// Grant `agents` access to the allocation based at `addr`.
    ///
    /// Grants are additive. A restricted allocation keeps its owner in the
    /// access list.
    pub fn allow_access(&self, agents: &[AgentId], addr: usize) -> Result<()> {
        let mut records = self.records.lock();
        let record = records.get_mut(&addr).ok_or(RuntimeError::InvalidAllocation(addr))?;
        record.region.allow_access(agents)?;

        for agent in agents {
            if !record.access.contains(agent) {
                record.access.push(*agent);
            }
        }
        if let Some(owner) = record.owner {
            if !record.access.contains(&owner) {
                record.access.push(owner);
            }
        }
        Ok(())
    }

    /// Find the allocation containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<AllocationInfo> {
        let records = self.records.lock();
        let (base, record) = records.range(..=addr).next_back()?;
        let end = base.checked_add(record.size.max(1))?;
        (addr < end).then(|| AllocationInfo {
            base: *base,
            size: record.size,
            region: Arc::clone(&record.region),
            owner: record.owner,
            access: record.access.clone(),
        })
    }

    /// Whether `addr` is the base of a live allocation
    pub fn contains(&self, addr: usize) -> bool {
        self.records.lock().contains_key(&addr)
    }

    /// Base addresses of all live allocations, ascending
    pub fn addresses(&self) -> Vec<usize> {
        self.records.lock().keys().copied().collect()
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Live allocations carved from `region`
    pub fn count_in_region(&self, region: RegionId) -> usize {
        self.records
            .lock()
            .values()
            .filter(|record| record.region.id() == region)
            .count()
    }

    /// Free every remaining allocation. Returns how many were released.
    pub(crate) fn release_all(&self) -> usize {
        let records = std::mem::take(&mut *self.records.lock());
        let count = records.len();
        for (addr, record) in records {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: see `free`.
                unsafe { record.region.free(ptr, record.size) };
            }
        }
        count
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        let leaked = self.release_all();
        if leaked > 0 {
            tracing::debug!(count = leaked, "released allocations on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Granularity, Segment};
    use proptest::prelude::*;

    fn region(granularity: Granularity) -> Arc<MemoryRegion> {
        Arc::new(MemoryRegion::new(
            RegionId::new(1),
            AgentId::new(1),
            Segment::Local,
            granularity,
            1 << 20,
            false,
        ))
    }

    #[test]
    fn test_allocate_and_free() {
        let tracker = AllocationTracker::new();
        let region = region(Granularity::Coarse);

        let ptr = tracker.allocate(&region, 256, false).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert!(tracker.contains(addr));
        assert_eq!(tracker.len(), 1);

        tracker.free(addr).unwrap();
        assert!(tracker.is_empty());
        assert_eq!(region.used(), 0);

        assert!(matches!(tracker.free(addr), Err(RuntimeError::InvalidAllocation(a)) if a == addr));
    }

    #[test]
    fn test_failed_allocation_leaves_no_record() {
        let tracker = AllocationTracker::new();
        let region = region(Granularity::Coarse);
        assert!(tracker.allocate(&region, 2 << 20, false).is_err());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_lookup_interior_pointer() {
        let tracker = AllocationTracker::new();
        let region = region(Granularity::Coarse);
        let ptr = tracker.allocate(&region, 100, false).unwrap();
        let base = ptr.as_ptr() as usize;

        let info = tracker.lookup(base + 40).unwrap();
        assert_eq!(info.base, base);
        assert_eq!(info.size, 100);
        assert!(info.contains_range(base + 40, 60));
        assert!(!info.contains_range(base + 40, 61));
        assert!(tracker.lookup(base + 100).is_none());
        assert!(tracker.lookup(base - 1).is_none());
    }

    #[test]
    fn test_allow_access_is_additive() {
        let tracker = AllocationTracker::new();
        let region = region(Granularity::Coarse);
        let addr = tracker.allocate(&region, 64, true).unwrap().as_ptr() as usize;

        assert_eq!(tracker.lookup(addr).unwrap().access, vec![AgentId::new(1)]);

        tracker.allow_access(&[AgentId::new(2)], addr).unwrap();
        tracker.allow_access(&[AgentId::new(3), AgentId::new(2)], addr).unwrap();

        let info = tracker.lookup(addr).unwrap();
        assert_eq!(info.owner, Some(AgentId::new(1)));
        assert_eq!(info.access, vec![AgentId::new(1), AgentId::new(2), AgentId::new(3)]);

        assert!(matches!(
            tracker.allow_access(&[AgentId::new(2)], addr + 1),
            Err(RuntimeError::InvalidAllocation(_))
        ));
    }

    #[test]
    fn test_release_all() {
        let tracker = AllocationTracker::new();
        let region = region(Granularity::Fine);
        for size in [1, 4096, 5000] {
            tracker.allocate(&region, size, false).unwrap();
        }
        assert_eq!(tracker.count_in_region(RegionId::new(1)), 3);
        assert_eq!(tracker.release_all(), 3);
        assert_eq!(region.used(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..10_000).prop_map(Op::Allocate),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn prop_keys_track_live_addresses(ops in proptest::collection::vec(op(), 1..64)) {
            let tracker = AllocationTracker::new();
            let region = Arc::new(MemoryRegion::new(
                RegionId::new(1),
                AgentId::new(0),
                Segment::System,
                Granularity::Fine,
                1 << 22,
                true,
            ));
            let mut live = std::collections::BTreeSet::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        if let Ok(ptr) = tracker.allocate(&region, size, false) {
                            prop_assert!(live.insert(ptr.as_ptr() as usize));
                        }
                    }
                    Op::Free(pick) if !live.is_empty() => {
                        let addr = *live.iter().nth(pick % live.len()).unwrap();
                        tracker.free(addr).unwrap();
                        live.remove(&addr);
                        prop_assert!(tracker.free(addr).is_err());
                    }
                    Op::Free(_) => {}
                }
                prop_assert_eq!(tracker.addresses(), live.iter().copied().collect::<Vec<_>>());
            }

            tracker.release_all();
            prop_assert_eq!(region.used(), 0);
        }
    }

    #[test]
    fn test_concurrent_allocate_free() {
        let tracker = Arc::new(AllocationTracker::new());
        let region = region(Granularity::Coarse);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let region = Arc::clone(&region);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let addr = tracker.allocate(&region, 128, false).unwrap().as_ptr() as usize;
                        tracker.free(addr).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.is_empty());
        assert_eq!(region.used(), 0);
    }
}
