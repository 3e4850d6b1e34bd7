//! Content-addressed kernel module cache
//!
//! One cache instance per runtime, owned explicitly rather than living in
//! process-global state. The cache guarantees at-most-one compilation per
//! content key for its whole lifetime: the first caller for a key compiles,
//! concurrent callers for the same key block on a per-key rendezvous and
//! reuse the result, and later callers hit the Ready entry directly.
//!
//! Compilation failure removes the entry so a corrected payload can retry.
//! Teardown unloads every Ready module exactly once; tearing down while a
//! compilation is in flight is a caller sequencing bug and fails fast.
//!
//! Synchronization is per key. The table lock is held only to look up or
//! insert a slot, never across a compilation, so unrelated keys proceed
//! independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::backend::{DeviceBackend, ModuleId};
use crate::error::{DespacharError, Result};
use crate::observability::{EventSink, KernelEvent};
use crate::program::KernelKey;

/// A loaded, invocable device kernel.
///
/// Owned by the cache; handed out behind `Arc` so dispatch can outlive the
/// table lock. Invocation goes through the backend that loaded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelModule {
    key: KernelKey,
    module_id: ModuleId,
}

impl KernelModule {
    /// Content key this module was compiled from
    #[must_use]
    pub fn key(&self) -> &KernelKey {
        &self.key
    }

    /// Backend handle for the loaded module
    #[must_use]
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that reused an existing or in-flight compilation
    pub hits: u64,
    /// Lookups that triggered a compilation
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served without compiling (0.0 to 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

enum SlotState {
    Compiling,
    Ready(Arc<KernelModule>),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Compiling),
            ready: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-runtime cache of compiled kernel modules, keyed by content hash.
pub struct ModuleCache {
    entries: Mutex<HashMap<KernelKey, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl ModuleCache {
    /// Create an empty cache reporting lifecycle events to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sink,
        }
    }

    /// Return the module for `key`, compiling `payload` at most once.
    ///
    /// The first caller for a key performs the compilation and emits one
    /// `Compiled` event; every other caller (concurrent or later) reuses the
    /// loaded module without recompiling and without an event.
    ///
    /// # Errors
    ///
    /// Returns `Compilation` when the backend rejects the payload. The entry
    /// is removed, so a later call with corrected input may retry. Waiting
    /// callers for the same key receive the same error.
    pub fn get_or_load<B: DeviceBackend>(
        &self,
        key: &KernelKey,
        payload: &[u8],
        backend: &B,
    ) -> Result<Arc<KernelModule>> {
        let (slot, is_compiler) = {
            let mut entries = self.lock_entries();
            match entries.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot::new());
                    entries.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if is_compiler {
            self.compile_into(&slot, key, payload, backend)
        } else {
            self.wait_for(&slot, key)
        }
    }

    fn compile_into<B: DeviceBackend>(
        &self,
        slot: &Slot,
        key: &KernelKey,
        payload: &[u8],
        backend: &B,
    ) -> Result<Arc<KernelModule>> {
        match backend.compile_module(key, payload) {
            Ok(module_id) => {
                let module = Arc::new(KernelModule {
                    key: key.clone(),
                    module_id,
                });
                *slot.lock_state() = SlotState::Ready(Arc::clone(&module));
                slot.ready.notify_all();
                self.misses.fetch_add(1, Ordering::SeqCst);
                self.sink.emit(KernelEvent::Compiled { key: key.clone() });
                Ok(module)
            }
            Err(e) => {
                let reason = e.to_string();
                // Remove before publishing the failure so no half-initialized
                // entry survives; a fresh call creates a new slot and retries.
                self.lock_entries().remove(key);
                *slot.lock_state() = SlotState::Failed(reason.clone());
                slot.ready.notify_all();
                Err(DespacharError::Compilation {
                    key: key.clone(),
                    reason,
                })
            }
        }
    }

    fn wait_for(&self, slot: &Slot, key: &KernelKey) -> Result<Arc<KernelModule>> {
        let mut state = slot.lock_state();
        while matches!(*state, SlotState::Compiling) {
            state = slot
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*state {
            SlotState::Ready(module) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::clone(module))
            }
            SlotState::Failed(reason) => Err(DespacharError::Compilation {
                key: key.clone(),
                reason: reason.clone(),
            }),
            SlotState::Compiling => unreachable!("loop exits only on a settled state"),
        }
    }

    /// Unload every Ready module, emitting one `Unloaded` event per module.
    ///
    /// Idempotent once the cache is drained.
    ///
    /// # Errors
    ///
    /// Returns `Lifecycle` if any entry is still compiling (teardown must be
    /// sequenced after all outstanding work drains; nothing is unloaded in
    /// that case), or if the backend fails to unload a module.
    pub fn teardown<B: DeviceBackend>(&self, backend: &B) -> Result<()> {
        let mut entries = self.lock_entries();

        for (key, slot) in entries.iter() {
            if matches!(*slot.lock_state(), SlotState::Compiling) {
                return Err(DespacharError::Lifecycle {
                    reason: format!("teardown requested while {key} is still compiling"),
                });
            }
        }

        let mut drained: Vec<(KernelKey, Arc<Slot>)> = entries.drain().collect();
        drop(entries);
        // HashMap order is arbitrary; unload in key order for determinism.
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let mut first_failure: Option<DespacharError> = None;
        for (key, slot) in drained {
            if let SlotState::Ready(module) = &*slot.lock_state() {
                match backend.unload_module(module.module_id()) {
                    Ok(()) => self.sink.emit(KernelEvent::Unloaded { key }),
                    Err(e) => {
                        first_failure.get_or_insert(DespacharError::Lifecycle {
                            reason: format!("failed to unload module for {key}: {e}"),
                        });
                    }
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// True when the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Snapshot of hit/miss counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<KernelKey, Arc<Slot>>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::observability::MemorySink;

    fn cache_with_sink() -> (ModuleCache, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (ModuleCache::new(sink.clone()), sink)
    }

    #[test]
    fn test_first_load_compiles_and_emits_once() {
        let (cache, sink) = cache_with_sink();
        let backend = MockBackend::new();
        let key = KernelKey::of(b"k");

        let module = cache.get_or_load(&key, b"k", &backend).unwrap();
        assert_eq!(module.key(), &key);
        assert_eq!(backend.compile_count(), 1);
        assert_eq!(sink.compiled_count(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 1 });
    }

    #[test]
    fn test_second_load_hits_without_event() {
        let (cache, sink) = cache_with_sink();
        let backend = MockBackend::new();
        let key = KernelKey::of(b"k");

        let first = cache.get_or_load(&key, b"k", &backend).unwrap();
        let second = cache.get_or_load(&key, b"k", &backend).unwrap();

        assert_eq!(first.module_id(), second.module_id());
        assert_eq!(backend.compile_count(), 1);
        assert_eq!(sink.compiled_count(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_distinct_keys_compile_independently() {
        let (cache, sink) = cache_with_sink();
        let backend = MockBackend::new();

        cache
            .get_or_load(&KernelKey::of(b"a"), b"a", &backend)
            .unwrap();
        cache
            .get_or_load(&KernelKey::of(b"b"), b"b", &backend)
            .unwrap();

        assert_eq!(backend.compile_count(), 2);
        assert_eq!(sink.compiled_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_compile_failure_removes_entry_and_allows_retry() {
        let (cache, sink) = cache_with_sink();
        let key = KernelKey::of(b"bad");
        let backend = MockBackend::new().with_compile_failure(key.clone());

        let err = cache.get_or_load(&key, b"bad", &backend).unwrap_err();
        assert!(matches!(err, DespacharError::Compilation { .. }));
        assert!(cache.is_empty());
        assert_eq!(sink.compiled_count(), 0);

        // Corrected toolchain input: the retry compiles fresh.
        backend.clear_compile_failure(&key);
        cache.get_or_load(&key, b"bad", &backend).unwrap();
        assert_eq!(sink.compiled_count(), 1);
    }

    #[test]
    fn test_teardown_unloads_each_ready_module_once() {
        let (cache, sink) = cache_with_sink();
        let backend = MockBackend::new();
        let a = KernelKey::of(b"a");
        let b = KernelKey::of(b"b");

        cache.get_or_load(&a, b"a", &backend).unwrap();
        cache.get_or_load(&b, b"b", &backend).unwrap();
        cache.teardown(&backend).unwrap();

        assert_eq!(backend.unload_count(), 2);
        assert_eq!(sink.unloaded_count(), 2);
        assert_eq!(sink.unloaded_for(&a), 1);
        assert_eq!(sink.unloaded_for(&b), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_teardown_is_idempotent_once_drained() {
        let (cache, sink) = cache_with_sink();
        let backend = MockBackend::new();

        cache
            .get_or_load(&KernelKey::of(b"k"), b"k", &backend)
            .unwrap();
        cache.teardown(&backend).unwrap();
        cache.teardown(&backend).unwrap();

        assert_eq!(sink.unloaded_count(), 1);
    }

    #[test]
    fn test_no_unload_event_for_failed_keys() {
        let (cache, sink) = cache_with_sink();
        let bad = KernelKey::of(b"bad");
        let backend = MockBackend::new().with_compile_failure(bad.clone());

        let _ = cache.get_or_load(&bad, b"bad", &backend);
        cache
            .get_or_load(&KernelKey::of(b"ok"), b"ok", &backend)
            .unwrap();
        cache.teardown(&backend).unwrap();

        assert_eq!(sink.unloaded_count(), 1);
        assert_eq!(sink.unloaded_for(&bad), 0);
    }

    #[test]
    fn test_concurrent_same_key_compiles_once() {
        use std::sync::Barrier;

        let (cache, sink) = cache_with_sink();
        let cache = Arc::new(cache);
        let backend = Arc::new(MockBackend::new());
        let key = KernelKey::of(b"shared");
        let start = Arc::new(Barrier::new(8));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let backend = Arc::clone(&backend);
                let key = key.clone();
                let start = Arc::clone(&start);
                scope.spawn(move || {
                    start.wait();
                    cache.get_or_load(&key, b"shared", &*backend).unwrap()
                });
            }
        });

        assert_eq!(backend.compile_count(), 1);
        assert_eq!(sink.compiled_count(), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
    }

    #[test]
    fn test_concurrent_failure_reaches_all_waiters() {
        use std::sync::Barrier;

        let (cache, _sink) = cache_with_sink();
        let cache = Arc::new(cache);
        let key = KernelKey::of(b"bad");
        let backend = Arc::new(MockBackend::new().with_compile_failure(key.clone()));
        let start = Arc::new(Barrier::new(4));

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let backend = Arc::clone(&backend);
                    let key = key.clone();
                    let start = Arc::clone(&start);
                    scope.spawn(move || {
                        start.wait();
                        cache.get_or_load(&key, b"bad", &*backend).is_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Whoever won the race failed; everyone who waited on that slot saw
        // the same failure. Late arrivals may have retried and failed again,
        // but nobody ever observed a half-initialized module.
        assert!(results.into_iter().all(|failed| failed));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_teardown_while_compiling_is_lifecycle_error() {
        use std::sync::Barrier;

        let (cache, sink) = cache_with_sink();
        let cache = Arc::new(cache);
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let backend = Arc::new({
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            MockBackend::new().with_compile_hook(move |_| {
                entered.wait();
                release.wait();
            })
        });

        let key = KernelKey::of(b"slow");
        std::thread::scope(|scope| {
            let worker = {
                let cache = Arc::clone(&cache);
                let backend = Arc::clone(&backend);
                let key = key.clone();
                scope.spawn(move || cache.get_or_load(&key, b"slow", &*backend))
            };

            entered.wait();
            let err = cache.teardown(&*backend).unwrap_err();
            assert!(matches!(err, DespacharError::Lifecycle { .. }));
            release.wait();

            worker.join().unwrap().unwrap();
        });

        // The entry survived the rejected teardown and is Ready now.
        assert_eq!(cache.len(), 1);
        cache.teardown(&*backend).unwrap();
        assert_eq!(sink.unloaded_count(), 1);
    }

    #[test]
    fn test_stats_hit_rate() {
        let stats = CacheStats { hits: 3, misses: 1 };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < f64::EPSILON);
    }
}
