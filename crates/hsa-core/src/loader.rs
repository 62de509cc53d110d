//! Code-object and executable ownership
//!
//! The runtime stores code objects and executables as opaque handles. It
//! never inspects their contents; it only ties their lifetime to the session.

use crate::error::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to a registered code object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeObjectHandle(u64);

impl CodeObjectHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CodeObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code_object{}", self.0)
    }
}

/// Handle to a loaded executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutableHandle(u64);

impl ExecutableHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executable{}", self.0)
    }
}

/// Store of opaque code-object blobs
#[derive(Debug, Default)]
pub struct CodeObjectManager {
    objects: RwLock<HashMap<CodeObjectHandle, Arc<[u8]>>>,
    next_id: AtomicU64,
}

impl CodeObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a code object and return its handle
    pub fn register(&self, bytes: impl Into<Arc<[u8]>>) -> Result<CodeObjectHandle> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(RuntimeError::invalid_argument("code object is empty"));
        }
        let handle = CodeObjectHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(%handle, bytes = bytes.len(), "registered code object");
        self.objects.write().insert(handle, bytes);
        Ok(handle)
    }

    pub fn get(&self, handle: CodeObjectHandle) -> Option<Arc<[u8]>> {
        self.objects.read().get(&handle).cloned()
    }

    pub fn unregister(&self, handle: CodeObjectHandle) -> Result<()> {
        self.objects
            .write()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::invalid_argument(format!("unknown {handle}")))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.objects.write().clear();
    }
}

/// Tracks executables built from registered code objects
#[derive(Debug, Default)]
pub struct Loader {
    executables: Mutex<BTreeMap<ExecutableHandle, Vec<CodeObjectHandle>>>,
    next_id: AtomicU64,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an executable from code objects known to `code_objects`
    pub fn create_executable(
        &self,
        code_objects: &CodeObjectManager,
        objects: &[CodeObjectHandle],
    ) -> Result<ExecutableHandle> {
        if let Some(missing) = objects.iter().find(|handle| code_objects.get(**handle).is_none()) {
            return Err(RuntimeError::invalid_argument(format!("unknown {missing}")));
        }
        let handle = ExecutableHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.executables.lock().insert(handle, objects.to_vec());
        Ok(handle)
    }

    pub fn destroy_executable(&self, handle: ExecutableHandle) -> Result<()> {
        self.executables
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::invalid_argument(format!("unknown {handle}")))
    }

    /// Live executables in creation order
    pub fn executables(&self) -> Vec<ExecutableHandle> {
        self.executables.lock().keys().copied().collect()
    }

    /// Code objects an executable was created from
    pub fn code_objects_of(&self, handle: ExecutableHandle) -> Option<Vec<CodeObjectHandle>> {
        self.executables.lock().get(&handle).cloned()
    }

    pub(crate) fn clear(&self) {
        let count = std::mem::take(&mut *self.executables.lock()).len();
        if count > 0 {
            tracing::debug!(count, "destroyed executables at unload");
        }
    }
}
