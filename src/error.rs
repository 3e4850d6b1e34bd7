//! Error types for the despachar runtime
//!
//! Four failure classes with distinct blast radii:
//! - `Consistency`: malformed program metadata, fatal at construction time
//! - `Compilation`: the device toolchain rejected a kernel payload, scoped to
//!   one cache key
//! - `Execution`: a dispatched operation failed at runtime, scoped to one
//!   `execute` call
//! - `Lifecycle`: teardown sequencing violation, a programming error

use thiserror::Error;

use crate::program::KernelKey;

/// Result type for all despachar operations
pub type Result<T> = std::result::Result<T, DespacharError>;

/// Errors produced by program construction, compilation, execution and
/// teardown.
#[derive(Debug, Error)]
pub enum DespacharError {
    /// Program metadata is internally inconsistent (e.g. a cache key on a
    /// non-cacheable operation, or two operations claiming the same key with
    /// different payloads). Aborts plan construction entirely.
    #[error("inconsistent program metadata: {reason}")]
    Consistency {
        /// What was inconsistent
        reason: String,
    },

    /// The device toolchain failed to compile or load a kernel payload.
    ///
    /// The cache entry for `key` is removed, so a later call with corrected
    /// input may retry.
    #[error("kernel compilation failed for {key}: {reason}")]
    Compilation {
        /// Content key of the payload that failed to compile
        key: KernelKey,
        /// Toolchain failure description
        reason: String,
    },

    /// A dispatched operation failed at runtime.
    ///
    /// Scoped to the failing `execute` call; neither the cache nor the plan
    /// is corrupted, and subsequent executions may succeed.
    #[error("execution failed at operation {op}: {reason}")]
    Execution {
        /// Ordinal id of the failing operation
        op: usize,
        /// Backend failure description
        reason: String,
    },

    /// Teardown was invoked while work was still in flight.
    #[error("lifecycle violation: {reason}")]
    Lifecycle {
        /// Which sequencing rule was violated
        reason: String,
    },
}

impl DespacharError {
    /// True for errors that indicate a bug in the caller rather than a
    /// recoverable condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DespacharError::Consistency { .. } | DespacharError::Lifecycle { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_display() {
        let err = DespacharError::Consistency {
            reason: "duplicate key".to_string(),
        };
        assert!(err.to_string().contains("inconsistent program metadata"));
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_compilation_display_includes_key() {
        let key = KernelKey::of(b"payload");
        let err = DespacharError::Compilation {
            key: key.clone(),
            reason: "bad ptx".to_string(),
        };
        assert!(err.to_string().contains(&key.to_string()));
        assert!(err.to_string().contains("bad ptx"));
    }

    #[test]
    fn test_execution_display_includes_op() {
        let err = DespacharError::Execution {
            op: 3,
            reason: "invalid launch".to_string(),
        };
        assert!(err.to_string().contains("operation 3"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DespacharError::Consistency {
            reason: String::new()
        }
        .is_fatal());
        assert!(DespacharError::Lifecycle {
            reason: String::new()
        }
        .is_fatal());
        assert!(!DespacharError::Execution {
            op: 0,
            reason: String::new()
        }
        .is_fatal());
        assert!(!DespacharError::Compilation {
            key: KernelKey::of(b"x"),
            reason: String::new()
        }
        .is_fatal());
    }
}
