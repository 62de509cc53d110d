//! Runtime extension and tool modules
//!
//! Modules are instantiated from factories every time the runtime loads.
//! Extensions load before tools and unload after them; `on_unload` always
//! runs before a module is dropped.

use crate::agent::{Agent, AgentId};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::registry::Registry;
use std::sync::Arc;

/// Whether a module extends the API surface or observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Extension,
    Tool,
}

/// View of the freshly loaded session handed to `on_load`
pub struct ModuleContext<'a> {
    registry: &'a Registry,
    config: &'a RuntimeConfig,
    host_agent: AgentId,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(registry: &'a Registry, config: &'a RuntimeConfig, host_agent: AgentId) -> Self {
        Self {
            registry,
            config,
            host_agent,
        }
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.registry.agents()
    }

    pub fn host_agent(&self) -> AgentId {
        self.host_agent
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.config
    }
}

/// A pluggable runtime module
pub trait RuntimeModule: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    /// Called once while the runtime loads. An error drops the module
    /// without calling `on_unload`.
    fn on_load(&mut self, ctx: &ModuleContext<'_>) -> Result<()>;

    /// Called once before the module is dropped at unload
    fn on_unload(&mut self);

    /// Extension bits reported through the `Extensions` system attribute
    fn extension_mask(&self) -> u64 {
        0
    }
}

/// Creates a fresh module instance for each load
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn RuntimeModule> + Send + Sync>;

/// Modules loaded into one session
#[derive(Default)]
pub(crate) struct ModuleSet {
    extensions: Vec<Box<dyn RuntimeModule>>,
    tools: Vec<Box<dyn RuntimeModule>>,
}

impl ModuleSet {
    /// Instantiate every factory and run `on_load`, extensions first.
    pub(crate) fn load(factories: &[ModuleFactory], ctx: &ModuleContext<'_>) -> Self {
        let (extensions, tools): (Vec<_>, Vec<_>) = factories
            .iter()
            .map(|factory| factory())
            .partition(|module| module.kind() == ModuleKind::Extension);

        Self {
            extensions: Self::load_all(extensions, ctx),
            tools: Self::load_all(tools, ctx),
        }
    }

    fn load_all(modules: Vec<Box<dyn RuntimeModule>>, ctx: &ModuleContext<'_>) -> Vec<Box<dyn RuntimeModule>> {
        modules
            .into_iter()
            .filter_map(|mut module| match module.on_load(ctx) {
                Ok(()) => {
                    tracing::info!(module = module.name(), kind = ?module.kind(), "loaded runtime module");
                    Some(module)
                }
                Err(e) => {
                    tracing::warn!(module = module.name(), error = %e, "runtime module failed to load");
                    None
                }
            })
            .collect()
    }

    /// OR of the extension masks of loaded extensions
    pub(crate) fn extension_mask(&self) -> u64 {
        self.extensions
            .iter()
            .fold(0, |mask, module| mask | module.extension_mask())
    }

    pub(crate) fn len(&self) -> usize {
        self.extensions.len() + self.tools.len()
    }

    /// Run `on_unload` on tools then extensions (reverse load order), then
    /// drop them all.
    pub(crate) fn unload(&mut self) {
        for module in self.tools.iter_mut().rev().chain(self.extensions.iter_mut().rev()) {
            tracing::debug!(module = module.name(), "unloading runtime module");
            module.on_unload();
        }
        self.tools.clear();
        self.extensions.clear();
    }
}

impl Drop for ModuleSet {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use parking_lot::Mutex;

    struct Probe {
        name: &'static str,
        kind: ModuleKind,
        fail: bool,
        mask: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RuntimeModule for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ModuleKind {
            self.kind
        }

        fn on_load(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
            self.log.lock().push(format!("load {}", self.name));
            if self.fail {
                Err(RuntimeError::module_load(self.name, "refused"))
            } else {
                Ok(())
            }
        }

        fn on_unload(&mut self) {
            self.log.lock().push(format!("unload {}", self.name));
        }

        fn extension_mask(&self) -> u64 {
            self.mask
        }
    }

    fn factory(
        name: &'static str,
        kind: ModuleKind,
        fail: bool,
        mask: u64,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> ModuleFactory {
        let log = Arc::clone(log);
        Arc::new(move || {
            Box::new(Probe {
                name,
                kind,
                fail,
                mask,
                log: Arc::clone(&log),
            }) as Box<dyn RuntimeModule>
        })
    }

    #[test]
    fn test_load_and_unload_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories = vec![
            factory("tool_a", ModuleKind::Tool, false, 0, &log),
            factory("ext_a", ModuleKind::Extension, false, 0b01, &log),
            factory("ext_b", ModuleKind::Extension, true, 0b10, &log),
            factory("ext_c", ModuleKind::Extension, false, 0b100, &log),
        ];
        let registry = Registry::new();
        let config = RuntimeConfig::default();
        let ctx = ModuleContext::new(&registry, &config, AgentId::new(0));

        let mut set = ModuleSet::load(&factories, &ctx);
        assert_eq!(set.len(), 3);
        assert_eq!(set.extension_mask(), 0b101);

        set.unload();
        assert_eq!(set.len(), 0);
        assert_eq!(
            *log.lock(),
            vec![
                "load ext_a",
                "load ext_b",
                "load ext_c",
                "load tool_a",
                "unload tool_a",
                "unload ext_c",
                "unload ext_a",
            ]
        );
    }

    #[test]
    fn test_drop_unloads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories = vec![factory("tool", ModuleKind::Tool, false, 0, &log)];
        let registry = Registry::new();
        let config = RuntimeConfig::default();
        {
            let _set = ModuleSet::load(&factories, &ModuleContext::new(&registry, &config, AgentId::new(0)));
        }
        assert_eq!(*log.lock(), vec!["load tool", "unload tool"]);
    }
}
