//! Process-scoped tracer state.
//!
//! Everything that outlives a single trace lives here: configuration, the
//! cache registry, registered force breaks, frame roots, the key and frame-id
//! sources, the graph compiler and statistics. A context is shared as
//! `Arc<TracerContext>` and is `Send + Sync`; [`TracerContext::reset`] clears
//! it between tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::TracerConfig;
use crate::host::code::FrameId;
use crate::host::value::{Module, ModuleKind, Value};

use super::backend::InterpreterBackend;
use super::cache::{CacheRegistry, FrameCache, TraceKey};
use super::graph::GraphCompiler;

static EMPTY_ROOT: LazyLock<Value> =
    LazyLock::new(|| Value::module(Module::new("root", ModuleKind::Container { forward: None })));

/// Tracer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Traces ended by a restart
    pub restarts: u64,
    /// Records inserted
    pub commits: u64,
    /// Non-empty traces dropped without a record
    pub abandoned: u64,
    /// Cached graphs executed instead of interpreting
    pub cache_hits: u64,
    /// Lookups where records existed but no guard held
    pub guard_failures: u64,
}

impl TraceStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.guard_failures;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

pub struct TracerContext {
    config: TracerConfig,
    compiler: Arc<dyn GraphCompiler>,
    cache: CacheRegistry,
    force_breaks: RwLock<HashSet<(FrameId, usize)>>,
    frame_roots: DashMap<FrameId, Value>,
    next_key: AtomicU64,
    next_frame_id: AtomicU64,
    stats: Mutex<TraceStats>,
}

impl TracerContext {
    /// Context using the reference [`InterpreterBackend`].
    pub fn new(config: TracerConfig) -> Self {
        Self::with_compiler(config, Arc::new(InterpreterBackend::new()))
    }

    pub fn with_compiler(config: TracerConfig, compiler: Arc<dyn GraphCompiler>) -> Self {
        Self {
            config,
            compiler,
            cache: CacheRegistry::new(),
            force_breaks: RwLock::new(HashSet::new()),
            frame_roots: DashMap::new(),
            next_key: AtomicU64::new(0),
            next_frame_id: AtomicU64::new(1),
            stats: Mutex::new(TraceStats::default()),
        }
    }

    pub fn shared(config: TracerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn compiler(&self) -> &dyn GraphCompiler {
        self.compiler.as_ref()
    }

    pub fn cache(&self) -> &CacheRegistry {
        &self.cache
    }

    pub fn frame_cache(&self, frame_id: FrameId) -> Arc<FrameCache> {
        self.cache.frame_cache(frame_id)
    }

    // === Force breaks ===

    /// End any trace that reaches original pc `pc` of `frame_id`.
    pub fn add_force_graph_break(&self, frame_id: FrameId, pc: usize) {
        self.force_breaks.write().insert((frame_id, pc));
    }

    pub fn has_force_graph_break(&self, frame_id: FrameId, pc: usize) -> bool {
        self.force_breaks.read().contains(&(frame_id, pc))
    }

    // === Identifiers ===

    pub fn new_trace_key(&self) -> TraceKey {
        TraceKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate a frame id for a newly prepared code object.
    pub fn next_frame_id(&self) -> FrameId {
        FrameId::new(self.next_frame_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Id the next prepared code object will receive.
    pub fn peek_next_frame_id(&self) -> FrameId {
        FrameId::new(self.next_frame_id.load(Ordering::Relaxed))
    }

    // === Frame roots ===

    /// Module whose submodules `call_module` nodes of this frame refer to.
    /// Frames without one get an empty container.
    pub fn frame_root(&self, frame_id: FrameId) -> Value {
        self.frame_roots
            .get(&frame_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| EMPTY_ROOT.clone())
    }

    pub fn set_frame_root(&self, frame_id: FrameId, root: Value) {
        self.frame_roots.insert(frame_id, root);
    }

    pub fn set_frame_root_if_absent(&self, frame_id: FrameId, root: &Value) {
        self.frame_roots.entry(frame_id).or_insert_with(|| root.clone());
    }

    // === Statistics ===

    pub fn stats(&self) -> TraceStats {
        *self.stats.lock()
    }

    pub(crate) fn record_restart(&self) {
        self.stats.lock().restarts += 1;
    }

    pub(crate) fn record_commit(&self) {
        self.stats.lock().commits += 1;
    }

    pub(crate) fn record_abandoned(&self) {
        self.stats.lock().abandoned += 1;
    }

    pub(crate) fn record_hit(&self) {
        self.stats.lock().cache_hits += 1;
    }

    pub(crate) fn record_guard_failure(&self) {
        self.stats.lock().guard_failures += 1;
    }

    /// Drop all records, force breaks, frame roots and statistics.
    ///
    /// Frame ids keep counting so ids already handed to interpreters stay
    /// unique.
    pub fn reset(&self) {
        self.cache.clear();
        self.force_breaks.write().clear();
        self.frame_roots.clear();
        self.next_key.store(0, Ordering::Relaxed);
        *self.stats.lock() = TraceStats::default();
    }
}

impl Default for TracerContext {
    fn default() -> Self {
        Self::new(TracerConfig::default())
    }
}

impl std::fmt::Debug for TracerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerContext")
            .field("config", &self.config)
            .field("compiler", &self.compiler.name())
            .field("records", &self.cache.total_records())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TracerContext>();
    }

    #[test]
    fn test_force_breaks_and_reset() {
        let ctx = TracerContext::default();
        let id = ctx.next_frame_id();
        ctx.add_force_graph_break(id, 3);
        assert!(ctx.has_force_graph_break(id, 3));
        assert!(!ctx.has_force_graph_break(id, 4));
        ctx.record_hit();
        ctx.reset();
        assert!(!ctx.has_force_graph_break(id, 3));
        assert_eq!(ctx.stats(), TraceStats::default());
        assert_ne!(ctx.next_frame_id(), id);
    }

    #[test]
    fn test_frame_ids_are_sequential() {
        let ctx = TracerContext::default();
        let peeked = ctx.peek_next_frame_id();
        assert_eq!(ctx.next_frame_id(), peeked);
        assert_eq!(ctx.peek_next_frame_id().as_u64(), peeked.as_u64() + 1);
    }

    #[test]
    fn test_frame_root_default_is_empty_container() {
        let ctx = TracerContext::default();
        let root = ctx.frame_root(FrameId::new(42));
        assert!(Module::named_modules(&root).is_empty());
        let custom = Value::module(Module::relu());
        ctx.set_frame_root_if_absent(FrameId::new(42), &custom);
        ctx.set_frame_root_if_absent(FrameId::new(42), &Value::none());
        assert!(ctx.frame_root(FrameId::new(42)).is(&custom));
    }

    #[test]
    fn test_trace_keys() {
        let ctx = TracerContext::default();
        assert_eq!(ctx.new_trace_key(), TraceKey(0));
        assert_eq!(ctx.new_trace_key(), TraceKey(1));
    }
}
