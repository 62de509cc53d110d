//! Runtime lifecycle and public operation surface
//!
//! A [`Runtime`] is a reference-counted connection to a driver. The first
//! [`acquire`](Runtime::acquire) loads a [`Session`]: it opens the driver,
//! builds agents and regions from the topology, loads runtime modules and
//! starts the async event monitor. The matching final
//! [`release`](Runtime::release) tears everything down in reverse.
//!
//! # Example
//!
//! ```rust
//! use hsa_core::{RuntimeBuilder, VirtualDriver};
//! use std::sync::Arc;
//!
//! # fn main() -> hsa_core::Result<()> {
//! let runtime = RuntimeBuilder::new(Arc::new(VirtualDriver::new())).build();
//! runtime.acquire()?;
//!
//! let session = runtime.session()?;
//! let ptr = runtime.allocate_memory(session.system_region(), 4096)?;
//! unsafe { runtime.fill_memory(ptr.as_ptr().cast(), 0xffff_ffff, 1024)? };
//! runtime.free_memory(ptr.as_ptr())?;
//!
//! assert!(runtime.release());
//! # Ok(())
//! # }
//! ```

use crate::agent::{Agent, AgentId, DeviceType};
use crate::allocation::AllocationTracker;
use crate::blit::BlitEngine;
use crate::config::RuntimeConfig;
use crate::copy::CopyOrchestrator;
use crate::driver::Driver;
use crate::error::{Result, RuntimeError};
use crate::events::{AsyncEventMonitor, HandlerAction};
use crate::loader::{CodeObjectManager, Loader};
use crate::module::{ModuleContext, ModuleFactory, ModuleSet, RuntimeModule};
use crate::region::{Granularity, MemoryRegion, RegionId, Segment};
use crate::registry::Registry;
use crate::signal::{Signal, SignalCondition, SignalValue};
use crate::system_info::{self, SystemAttribute, SystemFacts, SystemInfoValue};
use parking_lot::{Mutex, RwLock};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ================================================================================================
// Session
// ================================================================================================

/// Everything owned by one open driver session.
pub struct Session {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    registry: Registry,
    tracker: AllocationTracker,
    monitor: AsyncEventMonitor,
    modules: Mutex<ModuleSet>,
    loader: Loader,
    code_objects: CodeObjectManager,
    host_agent: AgentId,
    blit_agent: AgentId,
    system_region: Arc<MemoryRegion>,
    system_region_coarse: Arc<MemoryRegion>,
    gpu_ids: Vec<u32>,
    extension_mask: u64,
    svm_start: u64,
    svm_end: u64,
    timestamp_frequency: u64,
    unloaded: AtomicBool,
}

impl Session {
    fn load(driver: Arc<dyn Driver>, config: RuntimeConfig, factories: &[ModuleFactory]) -> Result<Self> {
        let _span = tracing::info_span!("runtime_load").entered();
        driver.open()?;

        match Self::build(Arc::clone(&driver), config, factories) {
            Ok(session) => {
                tracing::info!(
                    agents = session.registry.agent_count(),
                    regions = session.registry.region_count(),
                    host = %session.host_agent,
                    blit = %session.blit_agent,
                    "runtime loaded"
                );
                Ok(session)
            }
            Err(e) => {
                if let Err(close) = driver.close() {
                    tracing::warn!(error = %close, "driver close failed after load error");
                }
                Err(e)
            }
        }
    }

    fn build(driver: Arc<dyn Driver>, config: RuntimeConfig, factories: &[ModuleFactory]) -> Result<Self> {
        let topology = driver.topology()?;
        if topology.nodes.is_empty() {
            return Err(RuntimeError::NoAgents);
        }

        let registry = Registry::new();
        let slice = config.wait_slice();
        let mut next_region = 0u32;
        let mut host_agent = None;
        let mut blit_agent = None;
        let mut system_region = None;
        let mut system_region_coarse = None;
        let mut gpu_ids = Vec::new();

        for (index, node) in topology.nodes.iter().enumerate() {
            let agent_id = AgentId::new(index as u32);
            let is_host = node.device_type == DeviceType::Cpu && host_agent.is_none();

            let mut regions = Vec::new();
            for bank in &node.memory_banks {
                let flavours: &[(Granularity, bool)] = match bank.segment {
                    Segment::System => &[(Granularity::Fine, true), (Granularity::Coarse, true)],
                    Segment::Local => &[(Granularity::Coarse, bank.host_accessible)],
                };
                for &(granularity, host_accessible) in flavours {
                    let region = registry.register_memory_region(MemoryRegion::new(
                        RegionId::new(next_region),
                        agent_id,
                        bank.segment,
                        granularity,
                        bank.size,
                        host_accessible,
                    ));
                    next_region += 1;
                    regions.push(region.id());

                    if is_host && bank.segment == Segment::System {
                        let slot = match granularity {
                            Granularity::Fine => &mut system_region,
                            Granularity::Coarse => &mut system_region_coarse,
                        };
                        slot.get_or_insert(region);
                    }
                }
            }

            let has_engine = is_host || (node.device_type == DeviceType::Gpu && node.has_dma);
            let engine = if has_engine {
                Some(BlitEngine::spawn(agent_id, slice)?)
            } else {
                None
            };

            if is_host {
                host_agent = Some(agent_id);
            }
            if node.device_type == DeviceType::Gpu {
                gpu_ids.push(node.node_id);
                if node.has_dma && blit_agent.is_none() {
                    blit_agent = Some(agent_id);
                }
            }

            registry.register_agent(Agent::new(
                agent_id,
                node.node_id,
                node.device_type,
                node.name.clone(),
                regions,
                node.peers.clone(),
                engine,
            ));
        }

        let host_agent = host_agent.ok_or_else(|| RuntimeError::driver("topology has no CPU node"))?;
        let blit_agent = blit_agent.unwrap_or(host_agent);
        let system_region =
            system_region.ok_or_else(|| RuntimeError::driver("host node exposes no system memory"))?;
        let system_region_coarse =
            system_region_coarse.ok_or_else(|| RuntimeError::driver("host node exposes no system memory"))?;

        let modules = ModuleSet::load(factories, &ModuleContext::new(&registry, &config, host_agent));
        let extension_mask = modules.extension_mask();
        let monitor = AsyncEventMonitor::start(slice, config.monitor_join_timeout)?;

        Ok(Self {
            driver,
            config,
            registry,
            tracker: AllocationTracker::new(),
            monitor,
            modules: Mutex::new(modules),
            loader: Loader::new(),
            code_objects: CodeObjectManager::new(),
            host_agent,
            blit_agent,
            system_region,
            system_region_coarse,
            gpu_ids,
            extension_mask,
            svm_start: topology.svm_start,
            svm_end: topology.svm_end,
            timestamp_frequency: topology.timestamp_frequency,
            unloaded: AtomicBool::new(false),
        })
    }

    /// Tear the session down. Secondary failures are logged and swallowed.
    fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        let _span = tracing::info_span!("runtime_unload").entered();

        self.modules.lock().unload();
        self.monitor.shutdown();

        for agent in self.registry.agents() {
            if let Some(engine) = agent.blit_engine() {
                engine.shutdown();
            }
        }

        let leaked = self.tracker.release_all();
        if leaked > 0 {
            tracing::warn!(count = leaked, "freed allocations still live at unload");
        }

        self.loader.clear();
        self.code_objects.clear();
        self.registry.destroy_memory_regions();
        self.registry.destroy_agents();

        if let Err(e) = self.driver.close() {
            tracing::warn!(error = %e, "driver close failed during unload");
        }
        tracing::info!("runtime unloaded");
    }

    fn orchestrator(&self) -> CopyOrchestrator<'_> {
        CopyOrchestrator {
            registry: &self.registry,
            tracker: &self.tracker,
            config: &self.config,
            host_agent: self.host_agent,
            blit_agent: self.blit_agent,
            staging_region: &self.system_region,
        }
    }

    /// Designated host agent
    pub fn host_agent(&self) -> AgentId {
        self.host_agent
    }

    /// Designated transfer-capable agent
    pub fn blit_agent(&self) -> AgentId {
        self.blit_agent
    }

    /// Fine-grained system region shared by all agents
    pub fn system_region(&self) -> RegionId {
        self.system_region.id()
    }

    /// Coarse-grained system region shared by all agents
    pub fn system_region_coarse(&self) -> RegionId {
        self.system_region_coarse.id()
    }

    /// Driver node ids of GPU agents
    pub fn gpu_ids(&self) -> &[u32] {
        &self.gpu_ids
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    pub fn monitor(&self) -> &AsyncEventMonitor {
        &self.monitor
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn code_objects(&self) -> &CodeObjectManager {
        &self.code_objects
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of modules that loaded successfully
    pub fn module_count(&self) -> usize {
        self.modules.lock().len()
    }

    /// Whether `agent` can directly address the memory at `ptr`
    pub fn can_address(&self, agent: AgentId, ptr: *const u8) -> Result<bool> {
        let agent = self.registry.agent(agent)?;
        Ok(self.orchestrator().can_address(&agent, ptr as usize))
    }

    fn allocate(&self, region: RegionId, size: usize, restrict_access: bool) -> Result<NonNull<u8>> {
        let region = self.registry.region(region)?;
        self.tracker.allocate(&region, size, restrict_access)
    }

    fn allow_access(&self, agents: &[AgentId], ptr: *const u8) -> Result<()> {
        for agent in agents {
            self.registry.agent(*agent)?;
        }
        self.tracker.allow_access(agents, ptr as usize)
    }

    fn system_info(&self, key: u32) -> Result<SystemInfoValue> {
        let attribute = SystemAttribute::try_from(key)?;
        let facts = SystemFacts {
            timestamp: self.driver.timestamp(),
            timestamp_frequency: self.timestamp_frequency,
            extensions: self.extension_mask,
            svm_start: self.svm_start,
            svm_end: self.svm_end,
        };
        Ok(system_info::query(attribute, &facts))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host_agent", &self.host_agent)
            .field("blit_agent", &self.blit_agent)
            .field("agents", &self.registry.agent_count())
            .field("allocations", &self.tracker.len())
            .finish()
    }
}

// ================================================================================================
// Runtime
// ================================================================================================

/// Reference-counted runtime bound to one driver.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    modules: Vec<ModuleFactory>,
    /// Bootstrap lock: serializes the open/close transitions
    ref_count: Mutex<usize>,
    session: RwLock<Option<Arc<Session>>>,
    next_queue_id: AtomicU64,
}

impl Runtime {
    /// Runtime over `driver` with default configuration and no modules
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        RuntimeBuilder::new(driver).build()
    }

    /// Take a reference. The first one loads the session.
    ///
    /// A failed load leaves the runtime closed with a zero count.
    pub fn acquire(&self) -> Result<()> {
        let mut ref_count = self.ref_count.lock();
        if *ref_count == 0 {
            let session = Session::load(Arc::clone(&self.driver), self.config.clone(), &self.modules)?;
            *self.session.write() = Some(Arc::new(session));
        }
        *ref_count += 1;
        tracing::debug!(ref_count = *ref_count, "runtime acquired");
        Ok(())
    }

    /// Drop a reference. The last one unloads the session.
    ///
    /// Returns false for an unbalanced release.
    pub fn release(&self) -> bool {
        let mut ref_count = self.ref_count.lock();
        if *ref_count == 0 {
            tracing::warn!("unbalanced runtime release");
            return false;
        }
        *ref_count -= 1;
        tracing::debug!(ref_count = *ref_count, "runtime released");

        if *ref_count == 0 {
            let session = self.session.write().take();
            if let Some(session) = session {
                session.unload();
            }
        }
        true
    }

    /// Whether a session is open
    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        *self.ref_count.lock()
    }

    /// The open session
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or(RuntimeError::NotInitialized)
    }

    /// Visit every agent in registration order, stopping at the first error
    pub fn iterate_agents<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&Arc<Agent>) -> Result<()>,
    {
        self.session()?.registry.iterate_agents(callback)
    }

    /// Visit every region owned by `agent`
    pub fn iterate_regions<F>(&self, agent: AgentId, callback: F) -> Result<()>
    where
        F: FnMut(&Arc<MemoryRegion>) -> Result<()>,
    {
        self.session()?.registry.iterate_regions(agent, callback)
    }

    /// Allocate `size` bytes from `region`
    pub fn allocate_memory(&self, region: RegionId, size: usize) -> Result<NonNull<u8>> {
        self.allocate_memory_restricted(region, size, false)
    }

    /// Allocate `size` bytes from `region`, optionally restricted to the
    /// region's owning agent until access is granted
    pub fn allocate_memory_restricted(&self, region: RegionId, size: usize, restrict_access: bool) -> Result<NonNull<u8>> {
        self.session()?.allocate(region, size, restrict_access)
    }

    /// Free an allocation by base address
    pub fn free_memory(&self, ptr: *mut u8) -> Result<()> {
        self.session()?.tracker.free(ptr as usize)
    }

    /// Grant `agents` access to the allocation at `ptr` (additive)
    pub fn allow_access(&self, agents: &[AgentId], ptr: *const u8) -> Result<()> {
        self.session()?.allow_access(agents, ptr)
    }

    /// Blocking copy of `size` bytes.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub unsafe fn copy_memory(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        self.session()?.orchestrator().copy(dst, src, size)
    }

    /// Submit an asynchronous copy gated on `deps` reaching zero.
    ///
    /// Returns once the copy is queued; `completion` is decremented by one
    /// when it finishes. Fails with `NoTransferPath` when neither agent can
    /// address both sides.
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until `completion` has been decremented.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn copy_memory_async(
        &self,
        dst: *mut u8,
        dst_agent: AgentId,
        src: *const u8,
        src_agent: AgentId,
        size: usize,
        deps: &[Signal],
        completion: &Signal,
    ) -> Result<()> {
        self.session()?
            .orchestrator()
            .copy_async(dst, dst_agent, src, src_agent, size, deps, completion)
    }

    /// Blocking copy where one side is a raw user pointer (`dst_malloc`
    /// selects the destination).
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub unsafe fn copy_memory_host_alloc(&self, dst: *mut u8, src: *const u8, size: usize, dst_malloc: bool) -> Result<()> {
        self.session()?.orchestrator().copy_host_alloc(dst, src, size, dst_malloc)
    }

    /// Write `count` 32-bit words of `value` at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be writable for `count` words.
    pub unsafe fn fill_memory(&self, ptr: *mut u32, value: u32, count: usize) -> Result<()> {
        self.session()?.orchestrator().fill(ptr, value, count)
    }

    /// Query a system attribute by key
    pub fn get_system_info(&self, key: u32) -> Result<SystemInfoValue> {
        self.session()?.system_info(key)
    }

    /// Next queue identifier. Never reused for the lifetime of the runtime.
    pub fn get_queue_id(&self) -> Result<u64> {
        if !self.is_open() {
            return Err(RuntimeError::NotInitialized);
        }
        Ok(self.next_queue_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `handler` on the async event thread whenever `signal` satisfies
    /// `condition` against `value`
    pub fn set_async_signal_handler<F>(
        &self,
        signal: &Signal,
        condition: SignalCondition,
        value: SignalValue,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(SignalValue) -> HandlerAction + Send + 'static,
    {
        self.session()?
            .monitor
            .set_async_signal_handler(signal, condition, value, handler)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            tracing::debug!(ref_count = *self.ref_count.get_mut(), "runtime dropped while open");
            session.unload();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("ref_count", &self.ref_count())
            .field("open", &self.is_open())
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Assembles a [`Runtime`]
pub struct RuntimeBuilder {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    modules: Vec<ModuleFactory>,
}

impl RuntimeBuilder {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            config: RuntimeConfig::default(),
            modules: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a module factory, instantiated at every load
    pub fn module<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn RuntimeModule> + Send + Sync + 'static,
    {
        self.modules.push(Arc::new(factory));
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            driver: self.driver,
            config: self.config,
            modules: self.modules,
            ref_count: Mutex::new(0),
            session: RwLock::new(None),
            next_queue_id: AtomicU64::new(0),
        }
    }
}
