//! Guard and graph-function construction.
//!
//! Commit turns a trace into two closures:
//!
//! ```text
//!   guard(frame)    -> bool                 every GuardClause holds
//!   graph_fn(frame) -> Result<Vec<Value>>   read inputs, run artifact,
//!                                           assemble outputs in plan order
//! ```
//!
//! Both read the frame only through [`AccessPath`]s, and both are plain
//! `Arc<dyn Fn>` values, so a cached record is `Send + Sync`.

use std::fmt;
use std::sync::Arc;

use crate::host::tensor::{DType, Shape};
use crate::host::value::Value;

use super::access::{AccessPath, FrameAccess};
use super::cache::StorePos;
use super::error::GraphError;
use super::graph::{CompiledArtifact, Literal, NodeId, Scalar};

// ============================================================================
// Guards
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeCheck {
    Exact(Shape),
    /// Only the number of dimensions is fixed
    Rank(usize),
}

/// What must be true of the value at a path.
#[derive(Debug, Clone)]
pub enum GuardCheck {
    Scalar(Scalar),
    Literal(Literal),
    Tensor { dtype: DType, shape: ShapeCheck },
    Identity(Value),
}

impl GuardCheck {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Scalar(s) => s.matches(value),
            Self::Literal(lit) => lit.matches(value),
            Self::Tensor { dtype, shape } => value.as_tensor().is_some_and(|t| {
                t.dtype() == *dtype
                    && match shape {
                        ShapeCheck::Exact(s) => t.shape() == s.as_slice(),
                        ShapeCheck::Rank(r) => t.rank() == *r,
                    }
            }),
            Self::Identity(expected) => value.is(expected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardClause {
    pub path: AccessPath,
    pub check: GuardCheck,
}

impl GuardClause {
    /// A path that no longer resolves fails the clause.
    pub fn holds(&self, frame: &dyn FrameAccess) -> bool {
        self.path
            .resolve(frame)
            .is_some_and(|value| self.check.matches(&value))
    }
}

impl fmt::Display for GuardClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.check {
            GuardCheck::Scalar(s) => write!(f, "{} == {}", self.path, s),
            GuardCheck::Literal(lit) => write!(f, "{} == {}", self.path, lit),
            GuardCheck::Tensor { dtype, shape } => match shape {
                ShapeCheck::Exact(s) => {
                    write!(f, "check_tensor({}, {}, {:?})", self.path, dtype, s.as_slice())
                }
                ShapeCheck::Rank(r) => write!(f, "check_tensor({}, {}, rank={})", self.path, dtype, r),
            },
            GuardCheck::Identity(v) => write!(f, "id({}) == {} /* {} */", self.path, v.id(), v),
        }
    }
}

pub type GuardFn = Arc<dyn Fn(&dyn FrameAccess) -> bool + Send + Sync>;

/// Validity predicate of a cached graph.
#[derive(Clone)]
pub struct Guard {
    clauses: Arc<[GuardClause]>,
    func: GuardFn,
}

impl Guard {
    #[inline]
    pub fn check(&self, frame: &dyn FrameAccess) -> bool {
        (self.func)(frame)
    }

    pub fn clauses(&self) -> &[GuardClause] {
        &self.clauses
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("clauses", &self.clauses).finish()
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "True");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, " and ")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

/// Accumulates guard clauses in variable order.
#[derive(Debug, Default)]
pub struct GuardBuilder {
    clauses: Vec<GuardClause>,
    dynshape: bool,
}

impl GuardBuilder {
    /// With `dynshape`, tensor guards fix the rank but not the sizes.
    pub fn new(dynshape: bool) -> Self {
        Self {
            clauses: Vec::new(),
            dynshape,
        }
    }

    pub fn add_check(&mut self, path: AccessPath, check: GuardCheck) {
        self.clauses.push(GuardClause { path, check });
    }

    pub fn add_tensor_check(&mut self, path: AccessPath, dtype: DType, shape: &[usize]) {
        let shape = if self.dynshape {
            ShapeCheck::Rank(shape.len())
        } else {
            ShapeCheck::Exact(Shape::from_slice(shape))
        };
        self.add_check(path, GuardCheck::Tensor { dtype, shape });
    }

    pub fn clauses(&self) -> &[GuardClause] {
        &self.clauses
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn finish(self) -> Guard {
        let clauses: Arc<[GuardClause]> = self.clauses.into();
        let captured = Arc::clone(&clauses);
        let func: GuardFn = Arc::new(move |frame: &dyn FrameAccess| captured.iter().all(|c| c.holds(frame)));
        Guard { clauses, func }
    }
}

// ============================================================================
// Graph functions
// ============================================================================

#[derive(Debug, Clone)]
pub enum OutputSource {
    /// Index into the artifact's outputs
    Graph(usize),
    /// Value known at commit time
    Value(Value),
}

/// One write-back of a graph function.
#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub name: String,
    pub pos: StorePos,
    pub source: OutputSource,
}

impl fmt::Display for OutputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            OutputSource::Graph(i) => write!(f, "{} -> {} = graph_out[{}]", self.name, self.pos, i),
            OutputSource::Value(v) => write!(f, "{} -> {} = {}", self.name, self.pos, v),
        }
    }
}

pub type GraphFn = Arc<dyn Fn(&dyn FrameAccess) -> Result<Vec<Value>, GraphError> + Send + Sync>;

/// Accumulates graph inputs and the output plan.
#[derive(Debug, Default)]
pub struct GraphFnBuilder {
    inputs: Vec<AccessPath>,
    graph_outputs: Vec<NodeId>,
    slots: Vec<OutputSlot>,
}

impl GraphFnBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next placeholder input, read from `path`.
    pub fn add_graph_input(&mut self, path: AccessPath) {
        self.inputs.push(path);
    }

    pub fn inputs(&self) -> &[AccessPath] {
        &self.inputs
    }

    /// Write graph node `node` to `pos`. A node requested twice is computed once.
    pub fn output_node(&mut self, name: &str, pos: StorePos, node: NodeId) {
        let index = match self.graph_outputs.iter().position(|n| *n == node) {
            Some(i) => i,
            None => {
                self.graph_outputs.push(node);
                self.graph_outputs.len() - 1
            }
        };
        self.slots.push(OutputSlot {
            name: name.to_string(),
            pos,
            source: OutputSource::Graph(index),
        });
    }

    pub fn output_value(&mut self, name: &str, pos: StorePos, value: Value) {
        self.slots.push(OutputSlot {
            name: name.to_string(),
            pos,
            source: OutputSource::Value(value),
        });
    }

    /// Nodes the compiler must produce, in artifact output order.
    pub fn graph_outputs(&self) -> &[NodeId] {
        &self.graph_outputs
    }

    pub fn slots(&self) -> &[OutputSlot] {
        &self.slots
    }

    /// Write-back plan matching the graph function's result order.
    pub fn store_positions(&self) -> Vec<StorePos> {
        self.slots.iter().map(|s| s.pos.clone()).collect()
    }

    pub fn finish(self, artifact: Arc<dyn CompiledArtifact>) -> GraphFn {
        let Self {
            inputs,
            graph_outputs,
            slots,
        } = self;
        let run_graph = !graph_outputs.is_empty();
        let func: GraphFn = Arc::new(move |frame: &dyn FrameAccess| -> Result<Vec<Value>, GraphError> {
            let values = inputs
                .iter()
                .map(|path| {
                    path.resolve(frame)
                        .ok_or_else(|| GraphError::MissingInput(path.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let results = if run_graph { artifact.run(&values)? } else { Vec::new() };
            slots
                .iter()
                .map(|slot| match &slot.source {
                    OutputSource::Graph(i) => results.get(*i).cloned().ok_or(GraphError::MissingOutput(*i)),
                    OutputSource::Value(v) => Ok(v.clone()),
                })
                .collect()
        });
        func
    }
}
