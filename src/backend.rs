//! Device backend abstraction
//!
//! Abstracts the device toolchain and dispatch path so the runtime can be
//! exercised without real hardware. The runtime only needs four things from a
//! device: compile-and-load a payload, unload a module, launch one operation,
//! and submit a captured batch as a single atomic dispatch.
//!
//! Buffer binding stays opaque: each backend declares its own `Buffers` type,
//! which callers thread through `execute`. The runtime never allocates device
//! memory itself.

use std::collections::HashSet;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::KernelModule;
use crate::program::{KernelKey, OpKind, Operation};

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

/// Opaque handle for a module loaded on a device
pub type ModuleId = usize;

/// An operation paired with its resolved module, ready for dispatch.
#[derive(Debug)]
pub struct ResolvedOp<'a> {
    /// The operation to dispatch
    pub op: &'a Operation,
    /// Loaded module backing the operation, if it is cacheable
    pub module: Option<std::sync::Arc<KernelModule>>,
}

/// Abstraction over device compile/dispatch backends.
///
/// Implementations must be `Send + Sync`: the module cache may invoke
/// `compile_module` from whichever caller thread wins the per-key race.
pub trait DeviceBackend: Send + Sync {
    /// Device-specific buffer bindings threaded through execution
    type Buffers;

    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Compile and load a kernel payload, returning the loaded module handle.
    ///
    /// # Errors
    ///
    /// Returns an error when the device toolchain rejects the payload.
    fn compile_module(&self, key: &KernelKey, payload: &[u8]) -> BackendResult<ModuleId>;

    /// Unload a previously loaded module.
    ///
    /// # Errors
    ///
    /// Returns an error when the handle is unknown to the device.
    fn unload_module(&self, module: ModuleId) -> BackendResult<()>;

    /// Dispatch a single operation.
    ///
    /// # Errors
    ///
    /// Returns an error when the operation fails on the device.
    fn launch(
        &self,
        op: &Operation,
        module: Option<&KernelModule>,
        buffers: &mut Self::Buffers,
    ) -> BackendResult<()>;

    /// Submit a captured run of operations as one atomic dispatch.
    ///
    /// Member order must be preserved exactly.
    ///
    /// # Errors
    ///
    /// Returns an error when any member fails; the error should name the
    /// failing member via [`CommandBufferFailure`].
    fn submit_command_buffer(
        &self,
        batch: &[ResolvedOp<'_>],
        buffers: &mut Self::Buffers,
    ) -> BackendResult<()>;
}

/// Failure inside a batched submission, attributed to one member operation.
#[derive(Debug)]
pub struct CommandBufferFailure {
    /// Ordinal id of the failing member
    pub op: usize,
    /// Device failure description
    pub reason: String,
}

impl std::fmt::Display for CommandBufferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation {} failed in command buffer: {}", self.op, self.reason)
    }
}

impl Error for CommandBufferFailure {}

// ============================================================================
// Mock backend
// ============================================================================

/// Call record for [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `compile_module` was invoked
    Compile {
        /// Key being compiled
        key: KernelKey,
    },
    /// `unload_module` was invoked
    Unload {
        /// Handle being unloaded
        module: ModuleId,
    },
    /// `launch` was invoked
    Launch {
        /// Id of the dispatched operation
        op: usize,
    },
    /// `submit_command_buffer` was invoked
    Submit {
        /// Ids of the batched operations, in submission order
        ops: Vec<usize>,
    },
}

type CompileHook = Box<dyn Fn(&KernelKey) + Send + Sync>;

/// Backend double that records every call for verification.
///
/// Compile and launch failures are configurable per key / per operation id,
/// and an optional compile hook lets tests block inside `compile_module` to
/// exercise in-flight states.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    next_module: AtomicUsize,
    failing_keys: Mutex<HashSet<KernelKey>>,
    failing_ops: Mutex<HashSet<usize>>,
    compile_hook: Mutex<Option<CompileHook>>,
}

impl MockBackend {
    /// Create a mock that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make compilation fail for the given key.
    #[must_use]
    pub fn with_compile_failure(self, key: KernelKey) -> Self {
        self.lock(&self.failing_keys).insert(key);
        self
    }

    /// Make dispatch fail for the given operation id.
    #[must_use]
    pub fn with_launch_failure(self, op: usize) -> Self {
        self.lock(&self.failing_ops).insert(op);
        self
    }

    /// Install a hook invoked inside every `compile_module` call, before the
    /// module handle is allocated.
    #[must_use]
    pub fn with_compile_hook(self, hook: impl Fn(&KernelKey) + Send + Sync + 'static) -> Self {
        *self.lock(&self.compile_hook) = Some(Box::new(hook));
        self
    }

    /// Stop failing compilation for a key (models a corrected toolchain
    /// input on retry).
    pub fn clear_compile_failure(&self, key: &KernelKey) {
        self.lock(&self.failing_keys).remove(key);
    }

    /// All recorded calls, in order
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock(&self.calls).clone()
    }

    /// Number of `Compile` calls recorded
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::Compile { .. }))
            .count()
    }

    /// Number of `Unload` calls recorded
    #[must_use]
    pub fn unload_count(&self) -> usize {
        self.lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::Unload { .. }))
            .count()
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        self.lock(&self.calls).push(call);
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("calls", &self.lock(&self.calls).len())
            .field("failing_keys", &self.lock(&self.failing_keys).len())
            .field("failing_ops", &self.lock(&self.failing_ops).len())
            .finish()
    }
}

impl DeviceBackend for MockBackend {
    type Buffers = ();

    fn name(&self) -> &str {
        "mock"
    }

    fn compile_module(&self, key: &KernelKey, _payload: &[u8]) -> BackendResult<ModuleId> {
        if let Some(hook) = self.lock(&self.compile_hook).as_ref() {
            hook(key);
        }
        self.record(BackendCall::Compile { key: key.clone() });
        if self.lock(&self.failing_keys).contains(key) {
            return Err(format!("mock toolchain rejected {key}").into());
        }
        Ok(self.next_module.fetch_add(1, Ordering::SeqCst))
    }

    fn unload_module(&self, module: ModuleId) -> BackendResult<()> {
        self.record(BackendCall::Unload { module });
        Ok(())
    }

    fn launch(
        &self,
        op: &Operation,
        _module: Option<&KernelModule>,
        _buffers: &mut Self::Buffers,
    ) -> BackendResult<()> {
        self.record(BackendCall::Launch { op: op.id() });
        if self.lock(&self.failing_ops).contains(&op.id()) {
            return Err(format!("mock launch failure at operation {}", op.id()).into());
        }
        Ok(())
    }

    fn submit_command_buffer(
        &self,
        batch: &[ResolvedOp<'_>],
        _buffers: &mut Self::Buffers,
    ) -> BackendResult<()> {
        self.record(BackendCall::Submit {
            ops: batch.iter().map(|r| r.op.id()).collect(),
        });
        let failing = self.lock(&self.failing_ops);
        for resolved in batch {
            if failing.contains(&resolved.op.id()) {
                return Err(Box::new(CommandBufferFailure {
                    op: resolved.op.id(),
                    reason: "mock launch failure".to_string(),
                }));
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-process backend
// ============================================================================

/// Deterministic reference backend that executes programs in process.
///
/// "Compilation" validates that the payload is non-empty; dispatch appends
/// each executed operation id to the caller's trace buffer, so integration
/// tests can observe real dispatch order end to end.
#[derive(Debug, Default)]
pub struct InProcessBackend {
    next_module: AtomicUsize,
    loaded: Mutex<HashSet<ModuleId>>,
}

impl InProcessBackend {
    /// Create an in-process backend with no loaded modules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of modules currently loaded
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.lock_loaded().len()
    }

    fn lock_loaded(&self) -> std::sync::MutexGuard<'_, HashSet<ModuleId>> {
        self.loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DeviceBackend for InProcessBackend {
    type Buffers = Vec<usize>;

    fn name(&self) -> &str {
        "in-process"
    }

    fn compile_module(&self, key: &KernelKey, payload: &[u8]) -> BackendResult<ModuleId> {
        if payload.is_empty() {
            return Err(format!("empty payload for {key}").into());
        }
        let id = self.next_module.fetch_add(1, Ordering::SeqCst);
        self.lock_loaded().insert(id);
        Ok(id)
    }

    fn unload_module(&self, module: ModuleId) -> BackendResult<()> {
        if self.lock_loaded().remove(&module) {
            Ok(())
        } else {
            Err(format!("module {module} is not loaded").into())
        }
    }

    fn launch(
        &self,
        op: &Operation,
        module: Option<&KernelModule>,
        buffers: &mut Self::Buffers,
    ) -> BackendResult<()> {
        if op.kind() == OpKind::CustomCall && module.is_none() {
            return Err(format!("unbound custom call at operation {}", op.id()).into());
        }
        if let Some(module) = module {
            if !self.lock_loaded().contains(&module.module_id()) {
                return Err(format!("module for operation {} is not loaded", op.id()).into());
            }
        }
        buffers.push(op.id());
        Ok(())
    }

    fn submit_command_buffer(
        &self,
        batch: &[ResolvedOp<'_>],
        buffers: &mut Self::Buffers,
    ) -> BackendResult<()> {
        // Validate the whole batch before touching the trace: the submission
        // is atomic.
        for resolved in batch {
            if resolved.op.kind() == OpKind::CustomCall && resolved.module.is_none() {
                return Err(Box::new(CommandBufferFailure {
                    op: resolved.op.id(),
                    reason: "unbound custom call".to_string(),
                }));
            }
        }
        for resolved in batch {
            buffers.push(resolved.op.id());
        }
        Ok(())
    }
}
