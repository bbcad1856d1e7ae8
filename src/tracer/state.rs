//! Symbolic state of one in-flight trace.
//!
//! Holds the object table and graph under construction, plus the bookkeeping
//! that commit needs: where the trace started, which locals it wrote, and the
//! queue of operations whose results the host has not produced yet.
//!
//! Pending results: an operation is recorded while its instruction is about
//! to run, but its result only appears on the host stack after it ran. The
//! node goes into `pending` and [`TracerState::resolve_pending`] binds it at
//! the next instruction boundary, reading queue position `i` from stack depth
//! `i`.

use std::collections::{BTreeSet, HashMap};

use smallvec::SmallVec;

use crate::host::value::{Module, Object, ObjectId, Value};

use super::access::{AccessPath, FrameAccess};
use super::error::{TraceError, TraceResult};
use super::graph::{GraphBuilder, NodeId, NodeOp, Operand};
use super::object_table::ObjectTable;
use super::variables::{TensorVar, Variable};

#[derive(Debug)]
pub struct TracerState {
    objects: ObjectTable,
    graph: GraphBuilder,
    start_pc: Option<usize>,
    start_stack_depth: usize,
    is_empty: bool,
    stored_locals: BTreeSet<String>,
    pending: Vec<NodeId>,
    /// Submodule identity -> dotted path under the frame root
    submodule_paths: HashMap<ObjectId, String>,
}

impl TracerState {
    /// Fresh state that has read nothing from the frame.
    pub fn new(root: &Value, stack_depth: usize) -> Self {
        let mut submodule_paths = HashMap::new();
        for (path, module) in Module::named_modules(root) {
            submodule_paths.entry(module.id()).or_insert(path);
        }
        Self {
            objects: ObjectTable::new(),
            graph: GraphBuilder::new(root.clone()),
            start_pc: None,
            start_stack_depth: stack_depth,
            is_empty: true,
            stored_locals: BTreeSet::new(),
            pending: Vec::new(),
            submodule_paths,
        }
    }

    /// State for a trace starting at the frame's current instruction.
    ///
    /// With `read_stack`, every live stack slot becomes a guarded variable at
    /// `Stack(i)`, so the trace may consume values pushed before it began.
    pub fn from_frame(frame: &dyn FrameAccess, read_stack: bool, root: &Value) -> TraceResult<Self> {
        let mut state = Self::new(root, frame.stack_depth());
        if read_stack {
            for depth in 0..state.start_stack_depth {
                let value = frame.peek(depth).ok_or(TraceError::StackUnderflow(depth))?;
                if state.objects.contains(&value) {
                    continue;
                }
                let var = Variable::from_value(&value, AccessPath::Stack(depth), &mut state.graph)?;
                state.objects.add(var, value)?;
            }
        }
        Ok(state)
    }

    // === Operations ===

    /// Record `callable(*args, **kwargs)` as a graph node whose result is
    /// pending.
    pub fn record_operation(
        &mut self,
        callable: &Value,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> TraceResult<NodeId> {
        let op = match callable.object() {
            Object::Builtin(builtin) => NodeOp::CallFunction(*builtin),
            Object::Module(module) => match self.submodule_paths.get(&callable.id()) {
                Some(path) if module.is_leaf() => NodeOp::CallModule { path: path.clone() },
                Some(path) => {
                    return Err(TraceError::NotImplemented(format!(
                        "call to non-leaf module '{}'",
                        path
                    )))
                }
                None => {
                    return Err(TraceError::NotImplemented(format!(
                        "call to module {} outside the frame root",
                        module.name()
                    )))
                }
            },
            _ => {
                return Err(TraceError::NotImplemented(format!(
                    "call to {} object {}",
                    callable.type_name(),
                    callable
                )))
            }
        };

        let operands = args
            .iter()
            .map(|arg| self.operand(arg))
            .collect::<TraceResult<SmallVec<[Operand; 4]>>>()?;
        let kw_operands = kwargs
            .iter()
            .map(|(name, arg)| Ok((name.clone(), self.operand(arg)?)))
            .collect::<TraceResult<Vec<_>>>()?;

        let node = self.graph.create_node(op, operands, kw_operands);
        self.pending.push(node);
        Ok(node)
    }

    fn operand(&self, value: &Value) -> TraceResult<Operand> {
        self.objects.get(value, true)?.as_graph_node()
    }

    /// Bind every pending node to the value the host left on the stack.
    /// The queue is cleared even when binding fails.
    pub fn resolve_pending(&mut self, frame: &dyn FrameAccess) -> TraceResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for (depth, node) in pending.into_iter().enumerate() {
            let value = frame.peek(depth).ok_or(TraceError::StackUnderflow(depth))?;
            let var = match value.as_tensor() {
                Some(tensor) => Variable::Tensor(TensorVar::from_node(tensor, node)),
                None => return Err(TraceError::UnsupportedResult(value.type_name())),
            };
            self.objects.add(var, value)?;
        }
        Ok(())
    }

    /// Wrap `value` read from `path` unless it is already tracked.
    pub fn track(&mut self, value: Value, path: AccessPath) -> TraceResult<()> {
        if self.objects.contains(&value) {
            return Ok(());
        }
        let var = Variable::from_value(&value, path, &mut self.graph)?;
        self.objects.add(var, value)
    }

    // === Accessors ===

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    pub fn start_pc(&self) -> Option<usize> {
        self.start_pc
    }

    pub fn set_start_pc(&mut self, pc: usize) {
        self.start_pc = Some(pc);
    }

    pub fn start_stack_depth(&self) -> usize {
        self.start_stack_depth
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub(crate) fn set_empty(&mut self, empty: bool) {
        self.is_empty = empty;
    }

    pub fn stored_locals(&self) -> &BTreeSet<String> {
        &self.stored_locals
    }

    pub fn is_stored(&self, name: &str) -> bool {
        self.stored_locals.contains(name)
    }

    pub fn store_local(&mut self, name: impl Into<String>) {
        self.stored_locals.insert(name.into());
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn submodule_path(&self, module: &Value) -> Option<&str> {
        self.submodule_paths.get(&module.id()).map(String::as_str)
    }
}
