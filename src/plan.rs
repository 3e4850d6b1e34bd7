//! Execution plan assembly: batching capturable runs into command buffers
//!
//! The assembler rewrites a linear [`Program`] into an ordered sequence of
//! dispatch units. Maximal contiguous runs of capturable operations that meet
//! the configured minimum length are merged into a single command-buffer
//! unit, letting the device driver capture and replay the whole run as one
//! submission. Shorter runs pass through as individual dispatches: graph
//! capture has fixed setup overhead, so batching only pays above a minimum
//! run length.
//!
//! The rewrite is a single linear pass, order-preserving and lossless:
//! flattening the plan recovers the original operation sequence exactly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::program::{OpKind, Operation, Program};

/// Minimum capturable run length that is batched by default.
///
/// Runs of at least this many consecutive capturable operations become one
/// command buffer; shorter runs are dispatched individually.
pub const DEFAULT_MIN_BATCH_SIZE: usize = 5;

/// Tunable policy for command-buffer assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferConfig {
    /// Inclusive minimum run length for batching
    pub min_batch_size: usize,
}

impl Default for CommandBufferConfig {
    fn default() -> Self {
        Self {
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
        }
    }
}

impl CommandBufferConfig {
    /// Config with a custom batching threshold.
    #[must_use]
    pub fn with_min_batch_size(min_batch_size: usize) -> Self {
        Self { min_batch_size }
    }
}

/// One schedulable unit of an [`ExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchUnit {
    /// A single operation dispatched on its own
    Single(Operation),
    /// A contiguous run of capturable operations dispatched as one atomic
    /// submission, preserving original relative order. Never empty, never
    /// contains a non-capturable operation.
    CommandBuffer(Vec<Operation>),
}

impl DispatchUnit {
    /// Number of operations inside this unit
    #[must_use]
    pub fn op_count(&self) -> usize {
        match self {
            DispatchUnit::Single(_) => 1,
            DispatchUnit::CommandBuffer(ops) => ops.len(),
        }
    }

    /// True when this unit is a batched command buffer
    #[must_use]
    pub fn is_command_buffer(&self) -> bool {
        matches!(self, DispatchUnit::CommandBuffer(_))
    }
}

/// The rewritten dispatch sequence for one compiled program.
///
/// Immutable after assembly; owned by one runtime and destroyed with it.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    units: Vec<DispatchUnit>,
    config: CommandBufferConfig,
}

impl ExecutionPlan {
    /// Dispatch units in plan order
    #[must_use]
    pub fn units(&self) -> &[DispatchUnit] {
        &self.units
    }

    /// Number of dispatch units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True when the plan has no dispatch units
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The policy this plan was assembled under
    #[must_use]
    pub fn config(&self) -> &CommandBufferConfig {
        &self.config
    }

    /// Total operations across all units
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.units.iter().map(DispatchUnit::op_count).sum()
    }

    /// Recover the original operation sequence by flattening all units in
    /// order.
    #[must_use]
    pub fn flatten(&self) -> Vec<&Operation> {
        let mut out = Vec::with_capacity(self.op_count());
        for unit in &self.units {
            match unit {
                DispatchUnit::Single(op) => out.push(op),
                DispatchUnit::CommandBuffer(ops) => out.extend(ops.iter()),
            }
        }
        out
    }

    /// Human-readable listing of the plan, one line per dispatch unit.
    ///
    /// Intended for inspection and testing, not execution. Command-buffer
    /// lines carry the ids of their member operations.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, unit) in self.units.iter().enumerate() {
            match unit {
                DispatchUnit::Single(op) => {
                    let tag = match op.kind() {
                        OpKind::CustomCall => "custom-call",
                        OpKind::BuiltIn => "built-in",
                    };
                    out.push_str(&format!("{idx:03}: {tag} id={}\n", op.id()));
                }
                DispatchUnit::CommandBuffer(ops) => {
                    let ids: Vec<String> = ops.iter().map(|op| op.id().to_string()).collect();
                    out.push_str(&format!(
                        "{idx:03}: command-buffer [{}]\n",
                        ids.join(", ")
                    ));
                }
            }
        }
        out
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Rewrite a program into an execution plan under the given policy.
///
/// Single left-to-right pass, O(n) in operation count, stable: the rewrite
/// depends only on operation position and capturability, never on payload
/// contents.
#[must_use]
pub fn assemble(program: Program, config: &CommandBufferConfig) -> ExecutionPlan {
    let ops = program.into_ops();
    let mut units = Vec::with_capacity(ops.len());
    let mut run: Vec<Operation> = Vec::new();

    let flush = |run: &mut Vec<Operation>, units: &mut Vec<DispatchUnit>| {
        if run.is_empty() {
            return;
        }
        if run.len() >= config.min_batch_size {
            units.push(DispatchUnit::CommandBuffer(std::mem::take(run)));
        } else {
            units.extend(run.drain(..).map(DispatchUnit::Single));
        }
    };

    for op in ops {
        if op.is_capturable() {
            run.push(op);
        } else {
            flush(&mut run, &mut units);
            units.push(DispatchUnit::Single(op));
        }
    }
    flush(&mut run, &mut units);

    ExecutionPlan {
        units,
        config: config.clone(),
    }
}
