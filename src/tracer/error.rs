//! Error types for the tracer.
//!
//! Two tiers:
//! - [`TraceError`]: an unsupported pattern. Always recoverable; the tracker
//!   turns it into a restart and interpretation continues.
//! - [`FatalError`]: a broken invariant between the hook and the tracker.
//!   Continuing could publish a wrong guard, so the VM aborts.
//!
//! [`CompileError`] and [`GraphError`] belong to the graph backend contract.

use std::fmt;

use crate::host::code::FrameId;
use crate::host::frame::FrameHandle;
use crate::host::types::VmError;

use super::graph::NodeId;

/// Result type for tracing operations
pub type TraceResult<T> = Result<T, TraceError>;

/// Recoverable tracing failure; triggers a restart.
#[derive(Debug, Clone)]
pub enum TraceError {
    /// No variable representation exists for this runtime type
    UnknownType(&'static str),
    /// Variable has no graph operand form
    NotRepresentable(&'static str),
    /// Argument mix the tracer does not fuse
    Unsupported(String),
    /// Callable kind the graph cannot express
    NotImplemented(String),
    /// Value was never registered in the object table
    MissingObject(String),
    /// Value registered twice
    DuplicateObject(String),
    /// A deferred operation produced something other than a tensor
    UnsupportedResult(&'static str),
    /// `LOAD_FAST` of an unassigned local
    UnboundLocal(String),
    /// Stack shallower than an operand read
    StackUnderflow(usize),
    /// Attribute lookup failed while wrapping a method
    MissingAttribute { type_name: &'static str, name: String },
    /// Graph compiler rejected the trace
    Compile(CompileError),
    /// Control leaves the traceable region
    Break(&'static str),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown type {}", t),
            Self::NotRepresentable(kind) => write!(f, "{} is not representable in the graph", kind),
            Self::Unsupported(msg) => write!(f, "{}", msg),
            Self::NotImplemented(msg) => write!(f, "not implemented: {}", msg),
            Self::MissingObject(desc) => write!(f, "object {} is not tracked", desc),
            Self::DuplicateObject(desc) => write!(f, "object {} is already tracked", desc),
            Self::UnsupportedResult(t) => write!(f, "unsupported result type {}", t),
            Self::UnboundLocal(name) => write!(f, "local '{}' is unbound", name),
            Self::StackUnderflow(depth) => write!(f, "stack has no slot at depth {}", depth),
            Self::MissingAttribute { type_name, name } => {
                write!(f, "'{}' object has no attribute '{}'", type_name, name)
            }
            Self::Compile(e) => write!(f, "graph compile failed: {}", e),
            Self::Break(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Compile(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CompileError> for TraceError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

/// Consistency violation between the frame hook and the tracker stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Hook called with a frame id the top tracker does not own
    FrameMismatch { expected: FrameId, got: FrameId },
    /// Hook called with a frame handle the top tracker does not own
    HandleMismatch { expected: FrameHandle, got: FrameHandle },
    /// Tracker popped with an uncommitted trace
    TrackerNotEmpty(FrameId),
    /// Hook called with no tracker pushed
    NoActiveTracker,
    /// Placeholder count differs from graph inputs
    InputOrderMismatch { placeholders: usize, inputs: usize },
    /// A force break was registered on a `LOAD_METHOD`
    ForceBreakOnMethodLoad { pc: usize },
    /// Commit of a non-empty trace without a start pc
    MissingStartPc,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameMismatch { expected, got } => {
                write!(f, "frame id mismatch: tracker owns {}, hook passed {}", expected, got)
            }
            Self::HandleMismatch { expected, got } => {
                write!(f, "frame handle mismatch: tracker owns {}, hook passed {}", expected, got)
            }
            Self::TrackerNotEmpty(id) => write!(f, "tracker for frame {} popped with a live trace", id),
            Self::NoActiveTracker => write!(f, "no active tracker"),
            Self::InputOrderMismatch { placeholders, inputs } => write!(
                f,
                "graph has {} placeholders but {} inputs were captured",
                placeholders, inputs
            ),
            Self::ForceBreakOnMethodLoad { pc } => {
                write!(f, "force graph break on LOAD_METHOD at pc {}", pc)
            }
            Self::MissingStartPc => write!(f, "committing a trace with no start pc"),
        }
    }
}

impl std::error::Error for FatalError {}

/// Graph backend refused to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Requested output is not a node of the graph
    UnknownNode(NodeId),
    /// Operand refers to a node defined later
    ForwardReference { node: NodeId, operand: NodeId },
    /// `call_module` path does not resolve under the graph root
    UnknownModule(String),
    /// Backend-specific failure
    Backend(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(id) => write!(f, "unknown node {}", id),
            Self::ForwardReference { node, operand } => {
                write!(f, "node {} uses {} before it is defined", node, operand)
            }
            Self::UnknownModule(path) => write!(f, "no submodule at '{}'", path),
            Self::Backend(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

/// Failure while running a compiled graph or its closures.
#[derive(Debug, Clone)]
pub enum GraphError {
    /// Wrong number of inputs passed to an artifact
    InputCount { expected: usize, got: usize },
    /// An input access path no longer resolves
    MissingInput(String),
    /// Graph did not produce a requested output
    MissingOutput(usize),
    /// Operand refers to a node without a value
    UnboundNode(NodeId),
    /// Kernel failure
    Op(VmError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputCount { expected, got } => {
                write!(f, "expected {} graph inputs, got {}", expected, got)
            }
            Self::MissingInput(path) => write!(f, "input {} does not resolve", path),
            Self::MissingOutput(i) => write!(f, "graph output {} was not produced", i),
            Self::UnboundNode(id) => write!(f, "node {} has no value", id),
            Self::Op(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Op(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for GraphError {
    fn from(e: VmError) -> Self {
        Self::Op(e)
    }
}
