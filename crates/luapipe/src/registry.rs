//! Handle registry: host callbacks the worker may invoke, and the chunks the worker holds
//! on the host's behalf.
//!
//! Chunk cleanup is deferred. [`HandleRegistry::mark_destroyed`] only records the id; the
//! interpreter drains the pending set before its next chunk-producing or chunk-consuming
//! call and sends a single `cleanupChunks` for the whole batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{BridgeError, Result, ScriptError};
use crate::value::{FunctionHandle, InstanceId, Value};

/// A host function the worker can call. Returning `Err` raises the error inside the worker.
pub type Callback = Box<dyn FnMut(Vec<Value>) -> std::result::Result<Vec<Value>, ScriptError> + Send>;

/// Monotonic source of instance ids and callback uids.
///
/// Interpreters sharing an allocator never hand out the same id; [`IdAllocator::process`]
/// is the allocator shared by everything in the process.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process() -> Arc<Self> {
        static PROCESS: OnceLock<Arc<IdAllocator>> = OnceLock::new();
        Arc::clone(PROCESS.get_or_init(|| Arc::new(IdAllocator::new())))
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_instance(&self) -> InstanceId {
        InstanceId::new(self.next_id())
    }
}

pub struct HandleRegistry {
    instance: InstanceId,
    ids: Arc<IdAllocator>,
    callbacks: HashMap<String, Callback>,
    live_chunks: BTreeSet<i64>,
    destroyed: BTreeSet<i64>,
}

impl HandleRegistry {
    pub fn new(instance: InstanceId, ids: Arc<IdAllocator>) -> Self {
        Self {
            instance,
            ids,
            callbacks: HashMap::new(),
            live_chunks: BTreeSet::new(),
            destroyed: BTreeSet::new(),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Register `callback` under a fresh id of the form `<name>-<uid>`.
    pub fn register_callback(&mut self, name: &str, callback: Callback) -> String {
        let id = format!("{name}-{}", self.ids.next_id());
        self.callbacks.insert(id.clone(), callback);
        id
    }

    /// Register a callback that belongs to no library, as `anonymous*<uid>`.
    pub fn register_anonymous(&mut self, callback: Callback) -> String {
        let id = format!("anonymous*{}", self.ids.next_id());
        self.callbacks.insert(id.clone(), callback);
        id
    }

    /// Register a library's functions, returning `(function name, callback id)` pairs.
    ///
    /// All functions of one registration share a uid, so two libraries with the same name
    /// still get distinct ids.
    pub fn register_library(
        &mut self,
        library: &str,
        functions: impl IntoIterator<Item = (String, Callback)>,
    ) -> Vec<(String, String)> {
        let uid = self.ids.next_id();
        functions
            .into_iter()
            .map(|(name, callback)| {
                let id = format!("{library}-{name}-{uid}");
                self.callbacks.insert(id.clone(), callback);
                (name, id)
            })
            .collect()
    }

    pub fn has_callback(&self, id: &str) -> bool {
        self.callbacks.contains_key(id)
    }

    /// Invoke the callback registered under `id`.
    pub fn resolve_callback(
        &mut self,
        id: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Vec<Value>, ScriptError> {
        match self.callbacks.get_mut(id) {
            Some(callback) => callback(args),
            None => {
                tracing::warn!(instance = %self.instance, callback = id, "Worker called unknown callback");
                Err(ScriptError::new(format!("unknown callback id \"{id}\"")))
            }
        }
    }

    /// Fail unless `handle` was minted by this registry's interpreter.
    pub fn check_handle(&self, handle: &FunctionHandle) -> Result<()> {
        if handle.instance() == self.instance {
            Ok(())
        } else {
            Err(BridgeError::HandleMismatch {
                expected: self.instance,
                found: handle.instance(),
            })
        }
    }

    /// Record a chunk the worker handed out.
    pub fn new_chunk_handle(&mut self, local_id: i64) -> FunctionHandle {
        self.live_chunks.insert(local_id);
        FunctionHandle::new(self.instance, local_id)
    }

    /// Record every handle of this interpreter found anywhere inside `value`.
    pub fn adopt_handles(&mut self, value: &Value) {
        let instance = self.instance;
        let live = &mut self.live_chunks;
        value.for_each_function(&mut |handle| {
            if handle.instance() == instance {
                live.insert(handle.id());
            }
        });
    }

    /// Queue a chunk for cleanup. Releasing an already released chunk is a no-op.
    pub fn mark_destroyed(&mut self, handle: &FunctionHandle) -> Result<()> {
        self.check_handle(handle)?;
        if self.live_chunks.remove(&handle.id()) {
            self.destroyed.insert(handle.id());
        }
        Ok(())
    }

    pub fn is_live(&self, handle: &FunctionHandle) -> bool {
        handle.instance() == self.instance && self.live_chunks.contains(&handle.id())
    }

    /// Take the ids queued since the last drain, if any.
    pub fn drain_destroyed(&mut self) -> Option<BTreeSet<i64>> {
        if self.destroyed.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.destroyed))
        }
    }

    pub fn live_chunks(&self) -> Vec<i64> {
        self.live_chunks.iter().copied().collect()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("instance", &self.instance)
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .field("live_chunks", &self.live_chunks)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
