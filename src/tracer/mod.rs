//! Guard-based tracing front end.
//!
//! While the interpreter runs a frame, a [`GuardTracker`] follows it one
//! instruction at a time and builds:
//!
//! 1. an [`ObjectTable`] of every value the trace read, keyed by identity
//! 2. a [`Graph`] of the tensor operations it saw
//!
//! When the trace hits something it cannot follow, it commits: the table's
//! variables emit guard clauses and output extractors, the graph is compiled
//! by the context's [`GraphCompiler`], and the result is stored as a
//! [`CachedGraph`] keyed by frame id and start pc. Later executions that
//! reach the same pc with a passing guard run the graph instead.
//!
//! ```text
//!   frame ──on_step──► GuardTracker ──► TracerState { ObjectTable, GraphBuilder }
//!                           │ restart / return
//!                           ▼
//!                        commit ──► Guard + GraphFn ──► FrameCache
//! ```

pub mod access;
pub mod backend;
pub mod cache;
pub mod codegen;
pub mod context;
pub mod error;
pub mod graph;
pub mod object_table;
pub mod state;
pub mod tracker;
pub mod variables;

#[cfg(test)]
mod tests;

pub use access::{AccessPath, FrameAccess, InstructionMap, TracedFrame};
pub use backend::InterpreterBackend;
pub use cache::{CacheRegistry, CachedGraph, FrameCache, Lookup, StorePos, TraceKey};
pub use codegen::{Guard, GuardBuilder, GraphFn, GraphFnBuilder};
pub use context::{TraceStats, TracerContext};
pub use error::{CompileError, FatalError, GraphError, TraceError, TraceResult};
pub use graph::{CompiledArtifact, Graph, GraphBuilder, GraphCompiler, NodeId, NodeOp};
pub use object_table::ObjectTable;
pub use state::TracerState;
pub use tracker::{GuardTracker, TrackerStack};
pub use variables::{Origin, Variable};
