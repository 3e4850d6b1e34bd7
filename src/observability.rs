//! Kernel lifecycle events for external collectors
//!
//! The cache reports two events: one per successful first-time compilation
//! and one per module unload at teardown. Cache hits are silent. Consumers
//! plug in through [`EventSink`]; [`MemorySink`] is the in-process collector
//! used by tests and the CLI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::program::KernelKey;

/// Lifecycle event emitted by the module cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum KernelEvent {
    /// A kernel payload was compiled and initialized for the first time
    Compiled {
        /// Content key of the compiled payload
        key: KernelKey,
    },
    /// A loaded module was unloaded at cache teardown
    Unloaded {
        /// Content key of the unloaded module
        key: KernelKey,
    },
}

impl KernelEvent {
    /// Content key this event refers to
    #[must_use]
    pub fn key(&self) -> &KernelKey {
        match self {
            KernelEvent::Compiled { key } | KernelEvent::Unloaded { key } => key,
        }
    }
}

/// Destination for kernel lifecycle events.
///
/// Implementations must be safe to share across the threads that race on
/// `get_or_load`.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn emit(&self, event: KernelEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: KernelEvent) {}
}

/// In-memory sink that retains every event in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<KernelEvent>>,
    compiled: AtomicU64,
    unloaded: AtomicU64,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `Compiled` events recorded
    #[must_use]
    pub fn compiled_count(&self) -> u64 {
        self.compiled.load(Ordering::SeqCst)
    }

    /// Number of `Unloaded` events recorded
    #[must_use]
    pub fn unloaded_count(&self) -> u64 {
        self.unloaded.load(Ordering::SeqCst)
    }

    /// Snapshot of all recorded events in emission order
    #[must_use]
    pub fn events(&self) -> Vec<KernelEvent> {
        self.lock_events().clone()
    }

    /// Compiled events recorded for a specific key
    #[must_use]
    pub fn compiled_for(&self, key: &KernelKey) -> usize {
        self.lock_events()
            .iter()
            .filter(|e| matches!(e, KernelEvent::Compiled { key: k } if k == key))
            .count()
    }

    /// Unloaded events recorded for a specific key
    #[must_use]
    pub fn unloaded_for(&self, key: &KernelKey) -> usize {
        self.lock_events()
            .iter()
            .filter(|e| matches!(e, KernelEvent::Unloaded { key: k } if k == key))
            .count()
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Vec<KernelEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: KernelEvent) {
        match &event {
            KernelEvent::Compiled { .. } => self.compiled.fetch_add(1, Ordering::SeqCst),
            KernelEvent::Unloaded { .. } => self.unloaded.fetch_add(1, Ordering::SeqCst),
        };
        self.lock_events().push(event);
    }
}
