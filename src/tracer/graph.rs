//! Symbolic computation graph.
//!
//! A trace records tensor operations as nodes instead of values:
//!
//! ```text
//!   input_0 (placeholder, locals["x"])
//!      │
//!   %1 = call_module linear(%0)
//!      │
//!   %2 = call_function add(%1, 1.0)
//! ```
//!
//! Nodes are appended in program order, so every operand refers to an
//! earlier node. The graph is compiled by a [`GraphCompiler`] into a
//! [`CompiledArtifact`] that maps placeholder inputs to the requested outputs.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::host::value::{Builtin, Object, SliceValue, Value};

use super::access::AccessPath;
use super::error::{CompileError, GraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

// ============================================================================
// Literals
// ============================================================================

/// Plain scalar literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
}

impl Scalar {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.object() {
            Object::Int(i) => Some(Self::Int(*i)),
            Object::Float(f) => Some(Self::Float(*f)),
            Object::Bool(b) => Some(Self::Bool(*b)),
            Object::Str(s) => Some(Self::Str(Arc::clone(s))),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::int(*i),
            Self::Float(f) => Value::float(*f),
            Self::Bool(b) => Value::bool(*b),
            Self::Str(s) => Value::str(Arc::clone(s)),
        }
    }

    /// Same type and same value; floats compare by bit pattern.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value.object()) {
            (Self::Int(a), Object::Int(b)) => a == b,
            (Self::Float(a), Object::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Object::Bool(b)) => a == b,
            (Self::Str(a), Object::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "f64::from_bits(0x{:016x}) /* {:?} */", v.to_bits(), v),
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Constant operand baked into the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Scalar(Scalar),
    None,
    Slice(SliceValue),
}

impl Literal {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.object() {
            Object::None => Some(Self::None),
            Object::Slice(s) => Some(Self::Slice(*s)),
            _ => Scalar::from_value(value).map(Self::Scalar),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Scalar(s) => s.to_value(),
            Self::None => Value::none(),
            Self::Slice(s) => Value::slice(*s),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value.object()) {
            (Self::Scalar(s), _) => s.matches(value),
            (Self::None, Object::None) => true,
            (Self::Slice(a), Object::Slice(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{}", s),
            Self::None => write!(f, "None"),
            Self::Slice(s) => write!(f, "{}", s),
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Node(NodeId),
    Literal(Literal),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{}", id),
            Self::Literal(lit) => write!(f, "{}", lit),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    Placeholder { name: String },
    CallFunction(Builtin),
    /// Leaf submodule at a dotted path under the graph root
    CallModule { path: String },
}

impl NodeOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placeholder { .. } => "placeholder",
            Self::CallFunction(_) => "call_function",
            Self::CallModule { .. } => "call_module",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: NodeOp,
    pub args: SmallVec<[Operand; 4]>,
    pub kwargs: Vec<(String, Operand)>,
}

impl Node {
    /// All operands, positional first.
    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        self.args.iter().chain(self.kwargs.iter().map(|(_, op)| op))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            NodeOp::Placeholder { name } => return write!(f, "{} = placeholder {}", self.id, name),
            NodeOp::CallFunction(b) => write!(f, "{} = call_function {}(", self.id, b)?,
            NodeOp::CallModule { path } => write!(f, "{} = call_module {}(", self.id, path)?,
        }
        let mut first = true;
        for arg in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
            first = false;
        }
        for (name, arg) in &self.kwargs {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, arg)?;
            first = false;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Placeholders in creation order with the path their input is read from
    inputs: Vec<(NodeId, AccessPath)>,
    /// Module that `call_module` paths are resolved against
    root: Value,
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn inputs(&self) -> &[(NodeId, AccessPath)] {
        &self.inputs
    }

    pub fn placeholder_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, NodeOp::Placeholder { .. }))
            .count()
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}", node)?;
        }
        Ok(())
    }
}

/// Append-only construction of a [`Graph`].
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(root: Value) -> Self {
        Self {
            graph: Graph {
                nodes: Vec::new(),
                inputs: Vec::new(),
                root,
            },
        }
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.graph.nodes.len() as u32)
    }

    /// New graph input fed from `path`.
    pub fn create_placeholder(&mut self, path: AccessPath) -> NodeId {
        let id = self.next_id();
        let name = format!("input_{}", self.graph.inputs.len());
        self.graph.nodes.push(Node {
            id,
            op: NodeOp::Placeholder { name },
            args: SmallVec::new(),
            kwargs: Vec::new(),
        });
        self.graph.inputs.push((id, path));
        id
    }

    pub fn create_node(
        &mut self,
        op: NodeOp,
        args: SmallVec<[Operand; 4]>,
        kwargs: Vec<(String, Operand)>,
    ) -> NodeId {
        let id = self.next_id();
        self.graph.nodes.push(Node { id, op, args, kwargs });
        id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }
}

// ============================================================================
// Backend contract
// ============================================================================

/// Output of a [`GraphCompiler`].
pub trait CompiledArtifact: Send + Sync {
    /// Run on placeholder inputs (graph input order); returns the requested
    /// outputs in order.
    fn run(&self, inputs: &[Value]) -> Result<Vec<Value>, GraphError>;
}

/// Turns a traced graph into something runnable.
pub trait GraphCompiler: Send + Sync {
    fn name(&self) -> &'static str;

    fn compile(&self, graph: &Graph, outputs: &[NodeId]) -> Result<Arc<dyn CompiledArtifact>, CompileError>;
}
