//! Runtime: owns one execution plan and one module cache per loaded program
//!
//! The runtime dispatches plan units strictly in order. Cacheable operations
//! resolve their module through the cache before launching, so repeated
//! executions of the same program never pay compilation twice. Command-buffer
//! units resolve every member first, then go to the device as one atomic
//! submission.
//!
//! Destruction is ordered: the plan is dropped first (no further dispatches),
//! then the cache is torn down (all modules unloaded). Independent runtimes
//! share nothing and may execute fully in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{CommandBufferFailure, DeviceBackend, ResolvedOp};
use crate::cache::{CacheStats, KernelModule, ModuleCache};
use crate::error::{DespacharError, Result};
use crate::observability::EventSink;
use crate::plan::{assemble, CommandBufferConfig, DispatchUnit, ExecutionPlan};
use crate::program::{Operation, Program};

/// Summary of one successful `execute` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Dispatch units submitted, in plan order
    pub units: usize,
    /// Operations executed across all units
    pub operations: usize,
    /// Units that were batched command buffers
    pub command_buffers: usize,
}

/// Top-level owner of one program instance's plan and cache.
pub struct Runtime<B: DeviceBackend> {
    plan: Option<ExecutionPlan>,
    cache: ModuleCache,
    backend: B,
    in_flight: AtomicUsize,
    torn_down: bool,
}

impl<B: DeviceBackend> Runtime<B> {
    /// Assemble `program` under `config` and pair the plan with a fresh
    /// cache reporting to `sink`.
    #[must_use]
    pub fn new(
        program: Program,
        config: &CommandBufferConfig,
        backend: B,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let plan = assemble(program, config);
        Self {
            plan: Some(plan),
            cache: ModuleCache::new(sink),
            backend,
            in_flight: AtomicUsize::new(0),
            torn_down: false,
        }
    }

    /// The assembled plan.
    #[must_use]
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    /// The backend this runtime dispatches to.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot of the cache's hit/miss counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Execute the plan once against the given buffer bindings.
    ///
    /// Dispatch order across units is strictly sequential; member order
    /// inside a command buffer is preserved exactly as assembled.
    ///
    /// # Errors
    ///
    /// Returns `Compilation` if a kernel payload fails to compile (the cache
    /// entry is removed for retry), or `Execution` attributed to the failing
    /// operation's id. Neither corrupts the cache or the plan; a subsequent
    /// call may succeed.
    pub fn execute(&self, buffers: &mut B::Buffers) -> Result<ExecutionReport> {
        let Some(plan) = self.plan.as_ref() else {
            return Err(DespacharError::Lifecycle {
                reason: "execute called on a destroyed runtime".to_string(),
            });
        };

        let _guard = InFlightGuard::enter(&self.in_flight);
        let mut report = ExecutionReport::default();

        for unit in plan.units() {
            match unit {
                DispatchUnit::Single(op) => {
                    let module = self.resolve(op)?;
                    self.backend
                        .launch(op, module.as_deref(), buffers)
                        .map_err(|e| DespacharError::Execution {
                            op: op.id(),
                            reason: e.to_string(),
                        })?;
                    report.operations += 1;
                }
                DispatchUnit::CommandBuffer(ops) => {
                    // Resolve every member before submission; the at-most-one
                    // compile guarantee spans members, groups and executions.
                    let mut batch = Vec::with_capacity(ops.len());
                    for op in ops {
                        batch.push(ResolvedOp {
                            op,
                            module: self.resolve(op)?,
                        });
                    }
                    self.backend
                        .submit_command_buffer(&batch, buffers)
                        .map_err(|e| attribute_batch_failure(ops, e))?;
                    report.operations += ops.len();
                    report.command_buffers += 1;
                }
            }
            report.units += 1;
        }

        Ok(report)
    }

    /// Tear the runtime down: plan first, then cache.
    ///
    /// # Errors
    ///
    /// Returns `Lifecycle` if an execution is still in flight or a module
    /// cannot be unloaded.
    pub fn destroy(mut self) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            return Err(DespacharError::Lifecycle {
                reason: "destroy requested while an execution is in flight".to_string(),
            });
        }
        self.plan = None;
        let result = self.cache.teardown(&self.backend);
        self.torn_down = true;
        result
    }

    fn resolve(&self, op: &Operation) -> Result<Option<Arc<KernelModule>>> {
        match op.cache_key() {
            Some(key) => Ok(Some(self.cache.get_or_load(key, op.payload(), &self.backend)?)),
            None => Ok(None),
        }
    }
}

impl<B: DeviceBackend> Drop for Runtime<B> {
    fn drop(&mut self) {
        if !self.torn_down {
            self.plan = None;
            // Best effort: a runtime dropped without destroy() still unloads
            // whatever reached Ready.
            let _ = self.cache.teardown(&self.backend);
        }
    }
}

impl<B: DeviceBackend> std::fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("units", &self.plan.as_ref().map(ExecutionPlan::len))
            .field("cache", &self.cache)
            .finish()
    }
}

fn attribute_batch_failure(
    ops: &[Operation],
    error: Box<dyn std::error::Error + Send + Sync>,
) -> DespacharError {
    match error.downcast::<CommandBufferFailure>() {
        Ok(failure) => DespacharError::Execution {
            op: failure.op,
            reason: failure.reason,
        },
        // The backend could not attribute the failure; charge it to the
        // group's first member so the position is still meaningful.
        Err(other) => DespacharError::Execution {
            op: ops.first().map_or(0, Operation::id),
            reason: other.to_string(),
        },
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
