//! Guarded graph cache.
//!
//! Each frame id owns an append-only list of [`CachedGraph`] records. A record
//! is immutable once published and shared as `Arc<CachedGraph>`, so lookups
//! need only a read lock and may run from several threads.
//!
//! ```text
//!   CacheRegistry (DashMap<FrameId, Arc<FrameCache>>)
//!      └─ FrameCache (RwLock<Vec<Arc<CachedGraph>>>)
//!           ├─ [0] guard, graph_fn, pc 0..4, depth 0..1
//!           └─ [1] ...
//! ```
//!
//! Lookup walks records in insertion order and returns the first one whose
//! entry point matches and whose guard holds.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::host::code::FrameId;
use crate::host::value::Value;

use super::access::FrameAccess;
use super::codegen::{GraphFn, Guard};
use super::error::GraphError;

/// Where a graph-function output is written back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorePos {
    /// Stack slot counted from the top at `end_pc`
    Stack(usize),
    Local(String),
}

impl fmt::Display for StorePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack(i) => write!(f, "stack[{}]", i),
            Self::Local(name) => write!(f, "locals[\"{}\"]", name),
        }
    }
}

/// Identifier of one committed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceKey(pub u64);

impl fmt::Display for TraceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace_{:04}", self.0)
    }
}

/// One committed trace.
pub struct CachedGraph {
    pub guard: Guard,
    pub graph_fn: GraphFn,
    pub start_pc: usize,
    pub end_pc: usize,
    pub start_stack_depth: usize,
    pub end_stack_depth: usize,
    /// Write-back plan, parallel to the graph function's result
    pub return_values: Vec<StorePos>,
    pub key: TraceKey,
}

impl CachedGraph {
    #[inline]
    pub fn check_guard(&self, frame: &dyn FrameAccess) -> bool {
        self.guard.check(frame)
    }

    pub fn run(&self, frame: &dyn FrameAccess) -> Result<Vec<Value>, GraphError> {
        (self.graph_fn)(frame)
    }

    /// Whether this record starts at `pc` with `depth` stack slots.
    #[inline]
    pub fn is_entry(&self, pc: usize, depth: usize) -> bool {
        self.start_pc == pc && self.start_stack_depth == depth
    }
}

impl fmt::Debug for CachedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedGraph")
            .field("key", &self.key)
            .field("start_pc", &self.start_pc)
            .field("end_pc", &self.end_pc)
            .field("start_stack_depth", &self.start_stack_depth)
            .field("end_stack_depth", &self.end_stack_depth)
            .field("guard", &self.guard)
            .field("return_values", &self.return_values)
            .finish_non_exhaustive()
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Arc<CachedGraph>),
    /// Records start here but none of their guards hold
    GuardFailed,
    /// No record starts here
    NoEntry,
}

/// Records of one frame id, in insertion order.
#[derive(Debug, Default)]
pub struct FrameCache {
    records: RwLock<Vec<Arc<CachedGraph>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: CachedGraph) -> Arc<CachedGraph> {
        let record = Arc::new(record);
        let mut records = self.records.write();
        records.push(Arc::clone(&record));
        debug!(
            target: "graphtrace::cache",
            key = %record.key,
            start_pc = record.start_pc,
            end_pc = record.end_pc,
            records = records.len(),
            "record inserted"
        );
        record
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of all records.
    pub fn records(&self) -> Vec<Arc<CachedGraph>> {
        self.records.read().clone()
    }

    pub fn lookup(&self, pc: usize, depth: usize, frame: &dyn FrameAccess) -> Lookup {
        // Guards run outside the lock.
        let candidates: Vec<Arc<CachedGraph>> = self
            .records
            .read()
            .iter()
            .filter(|r| r.is_entry(pc, depth))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Lookup::NoEntry;
        }
        candidates
            .into_iter()
            .find(|r| r.check_guard(frame))
            .map_or(Lookup::GuardFailed, Lookup::Hit)
    }
}

/// Process-lifetime map from frame id to its records.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    frames: DashMap<FrameId, Arc<FrameCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for `frame_id`, created on first use.
    pub fn frame_cache(&self, frame_id: FrameId) -> Arc<FrameCache> {
        Arc::clone(self.frames.entry(frame_id).or_default().value())
    }

    pub fn get(&self, frame_id: FrameId) -> Option<Arc<FrameCache>> {
        self.frames.get(&frame_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of records for `frame_id`.
    pub fn record_count(&self, frame_id: FrameId) -> usize {
        self.get(frame_id).map_or(0, |cache| cache.len())
    }

    pub fn total_records(&self) -> usize {
        self.frames.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn clear(&self) {
        self.frames.clear();
    }
}
