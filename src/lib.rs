//! # Despachar
//!
//! Device-program execution runtime with command-buffer batching and
//! content-addressed kernel module caching.
//!
//! Despachar (Spanish: "to dispatch") takes a linear sequence of device
//! operations and rewrites it into an execution plan that amortizes
//! host-to-device dispatch overhead: maximal contiguous runs of capturable
//! operations are merged into single command-buffer submissions, while a
//! per-runtime module cache guarantees each distinct kernel payload is
//! compiled and loaded at most once for the runtime's lifetime.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use despachar::{
//!     CommandBufferConfig, InProcessBackend, MemorySink, Operation, Program, Runtime,
//! };
//!
//! let program = Program::new(vec![
//!     Operation::custom_call(b"kernel-a".to_vec()),
//!     Operation::custom_call(b"kernel-b".to_vec()),
//! ])?;
//!
//! let sink = Arc::new(MemorySink::new());
//! let runtime = Runtime::new(
//!     program,
//!     &CommandBufferConfig::default(),
//!     InProcessBackend::new(),
//!     sink.clone(),
//! );
//!
//! let mut trace = Vec::new();
//! let report = runtime.execute(&mut trace)?;
//! assert_eq!(report.operations, 2);
//! assert_eq!(sink.compiled_count(), 2);
//!
//! runtime.destroy()?;
//! assert_eq!(sink.unloaded_count(), 2);
//! # Ok::<(), despachar::DespacharError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Program (validated operation sequence)
//!    │
//!    └─► assemble() ─► ExecutionPlan (singles + command-buffer groups)
//!               │
//!               └─► Runtime::execute()
//!                       │
//!                       ├─► ModuleCache::get_or_load()  (compile once per key)
//!                       └─► DeviceBackend               (launch / submit batch)
//! ```
//!
//! ## Guarantees
//!
//! - The plan rewrite is lossless and order-preserving: flattening the plan
//!   recovers the original operation sequence exactly.
//! - At most one compilation per content key per runtime, under any call
//!   pattern and any concurrency.
//! - Deterministic teardown: plan first, then one unload per Ready module.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)] // hit-rate counters to f64

pub mod backend;
pub mod cache;
pub mod error;
pub mod observability;
pub mod plan;
pub mod program;
pub mod runtime;

// Re-exports for convenience
pub use backend::{
    BackendCall, BackendResult, CommandBufferFailure, DeviceBackend, InProcessBackend,
    MockBackend, ModuleId, ResolvedOp,
};
pub use cache::{CacheStats, KernelModule, ModuleCache};
pub use error::{DespacharError, Result};
pub use observability::{EventSink, KernelEvent, MemorySink, NullSink};
pub use plan::{assemble, CommandBufferConfig, DispatchUnit, ExecutionPlan};
pub use program::{KernelKey, OpKind, Operation, Program};
pub use runtime::{ExecutionReport, Runtime};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
