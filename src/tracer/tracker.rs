//! Per-frame trace driver.
//!
//! The interpreter calls [`GuardTracker::on_step`] before every instruction.
//! Each call runs this sequence:
//!
//! ```text
//!   resolve pending results ──► map raw ip to original pc ──(injected)──► restart
//!            │
//!            ▼
//!   force break at pc? ──yes──► restart
//!            │
//!            ▼
//!   previous step failed? ──yes──► rebuild state from frame ──(fails)──► restart
//!            │
//!            ▼
//!   record start pc, dispatch opcode ──(error / no handler)──► restart
//! ```
//!
//! A restart commits whatever the trace recorded so far and marks the tracker
//! as failed, so the following instruction starts a fresh trace. Commit turns
//! a non-empty trace into a [`CachedGraph`] in the frame's cache.
//!
//! Trackers nest with calls: [`TrackerStack`] pushes one per frame and pops
//! it when the frame returns.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, info, trace, warn};

use crate::host::analysis::livevars_analysis;
use crate::host::code::{FrameId, Instruction, ProcessedCode};
use crate::host::frame::FrameHandle;
use crate::host::opcodes::Opcode;
use crate::host::value::{Builtin, Value};

use super::access::{AccessPath, InstructionMap, TracedFrame};
use super::cache::{CachedGraph, StorePos};
use super::codegen::{GraphFnBuilder, GuardBuilder};
use super::context::TracerContext;
use super::error::{FatalError, TraceError, TraceResult};
use super::graph::{NodeId, NodeOp};
use super::state::TracerState;
use super::variables::Variable;

/// Why a commit produced no record.
enum CommitError {
    Trace(TraceError),
    Fatal(FatalError),
}

impl From<TraceError> for CommitError {
    fn from(e: TraceError) -> Self {
        Self::Trace(e)
    }
}

impl From<FatalError> for CommitError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

impl From<super::error::CompileError> for CommitError {
    fn from(e: super::error::CompileError) -> Self {
        Self::Trace(TraceError::Compile(e))
    }
}

fn peek(frame: &dyn TracedFrame, depth: usize) -> TraceResult<Value> {
    frame.peek(depth).ok_or(TraceError::StackUnderflow(depth))
}

pub struct GuardTracker {
    ctx: Arc<TracerContext>,
    code: Arc<ProcessedCode>,
    frame_id: FrameId,
    frame: FrameHandle,
    frame_root: Value,
    state: TracerState,
    have_error: bool,
    last_restart: Option<String>,
}

impl GuardTracker {
    pub fn new(
        frame: &dyn TracedFrame,
        frame_id: FrameId,
        code: Arc<ProcessedCode>,
        ctx: Arc<TracerContext>,
    ) -> Self {
        let frame_root = ctx.frame_root(frame_id);
        let state = TracerState::new(&frame_root, frame.stack_depth());
        Self {
            ctx,
            code,
            frame_id,
            frame: frame.handle(),
            frame_root,
            state,
            have_error: false,
            last_restart: None,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn state(&self) -> &TracerState {
        &self.state
    }

    /// No trace in flight: the cache may be consulted.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state.is_empty()
    }

    pub fn have_error(&self) -> bool {
        self.have_error
    }

    /// Reason of the most recent restart
    pub fn last_restart(&self) -> Option<&str> {
        self.last_restart.as_deref()
    }

    /// The interpreter jumped over code the tracker did not see; rebuild the
    /// state at the next step.
    pub fn resync(&mut self) {
        self.have_error = true;
        self.state.set_empty(true);
    }

    fn init_state(&mut self, frame: &dyn TracedFrame) -> TraceResult<()> {
        self.state = TracerState::from_frame(frame, true, &self.frame_root)?;
        self.have_error = false;
        Ok(())
    }

    // ========================================================================
    // Step
    // ========================================================================

    pub fn on_step(&mut self, frame: &dyn TracedFrame, frame_id: FrameId) -> Result<(), FatalError> {
        if frame_id != self.frame_id {
            return Err(FatalError::FrameMismatch {
                expected: self.frame_id,
                got: frame_id,
            });
        }
        if frame.handle() != self.frame {
            return Err(FatalError::HandleMismatch {
                expected: self.frame,
                got: frame.handle(),
            });
        }

        if let Err(e) = self.state.resolve_pending(frame) {
            return self.restart(frame, &e.to_string());
        }

        let raw = frame.last_instruction();
        let Some((pc, inst)) = self.code.get_orig_inst(raw) else {
            return self.restart(frame, &format!("running injected code (lasti={})", raw));
        };

        if self.ctx.has_force_graph_break(self.frame_id, pc) {
            if inst.opcode == Opcode::LoadMethod {
                return Err(FatalError::ForceBreakOnMethodLoad { pc });
            }
            return self.restart(frame, &format!("force graph break (pc = {})", pc));
        }

        if self.have_error {
            if let Err(e) = self.init_state(frame) {
                return self.restart(frame, &format!("exception during init: {}", e));
            }
        }

        if self.state.start_pc().is_none() {
            self.state.set_start_pc(pc);
        }

        match self.dispatch(frame, inst) {
            Some(Ok(())) => {
                self.state.set_empty(false);
                Ok(())
            }
            Some(Err(e)) => self.restart(frame, &e.to_string()),
            None => self.restart(frame, &format!("unknown opcode {}", inst.opcode)),
        }
    }

    fn restart(&mut self, frame: &dyn TracedFrame, reason: &str) -> Result<(), FatalError> {
        info!(
            target: "graphtrace::tracker",
            frame_id = %self.frame_id,
            ip = frame.last_instruction(),
            reason,
            "restart"
        );
        self.ctx.record_restart();
        self.last_restart = Some(reason.to_string());
        self.have_error = true;
        self.commit(frame)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn dispatch(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> Option<TraceResult<()>> {
        trace!(target: "graphtrace::tracker", opcode = %inst.opcode, arg = inst.arg, "dispatch");
        let result = match inst.opcode {
            Opcode::BinaryAdd => self.binary_op(frame, Builtin::Add),
            Opcode::BinarySubtract => self.binary_op(frame, Builtin::Sub),
            Opcode::BinaryMultiply => self.binary_op(frame, Builtin::Mul),
            Opcode::BinaryTrueDivide => self.binary_op(frame, Builtin::TrueDiv),
            Opcode::BinarySubscr => self.binary_op(frame, Builtin::GetItem),
            Opcode::UnaryNegative => self.unary_op(frame, Builtin::Neg),
            Opcode::LoadConst | Opcode::BuildSlice | Opcode::PopTop | Opcode::Nop => Ok(()),
            Opcode::LoadFast => self.load_fast(frame, inst),
            Opcode::LoadGlobal => self.load_global(frame, inst),
            Opcode::LoadMethod => self.load_method(frame, inst),
            Opcode::CallMethod => self.call_method(frame, inst),
            Opcode::CallFunction => self.call_function_op(frame, inst),
            Opcode::StoreFast => self.store_fast(inst),
            Opcode::ReturnValue => Err(TraceError::Break("return value")),
            Opcode::LoadAttr | Opcode::JumpAbsolute | Opcode::PopJumpIfFalse => return None,
        };
        Some(result)
    }

    fn local_name(&self, inst: Instruction) -> TraceResult<String> {
        self.code
            .code()
            .varname(inst.arg)
            .map(str::to_owned)
            .ok_or_else(|| TraceError::Unsupported(format!("bad local index {}", inst.arg)))
    }

    fn global_name(&self, inst: Instruction) -> TraceResult<String> {
        self.code
            .code()
            .name_at(inst.arg)
            .map(str::to_owned)
            .ok_or_else(|| TraceError::Unsupported(format!("bad name index {}", inst.arg)))
    }

    fn binary_op(&mut self, frame: &dyn TracedFrame, op: Builtin) -> TraceResult<()> {
        let rhs = peek(frame, 0)?;
        let lhs = peek(frame, 1)?;
        self.call_function(&Value::builtin(op), &[lhs, rhs], &[])
    }

    fn unary_op(&mut self, frame: &dyn TracedFrame, op: Builtin) -> TraceResult<()> {
        let operand = peek(frame, 0)?;
        self.call_function(&Value::builtin(op), &[operand], &[])
    }

    fn load_fast(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> TraceResult<()> {
        let name = self.local_name(inst)?;
        if self.state.is_stored(&name) {
            return Ok(());
        }
        let value = frame
            .local(&name)
            .ok_or_else(|| TraceError::UnboundLocal(name.clone()))?;
        self.state.track(value, AccessPath::Local(name))
    }

    fn load_global(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> TraceResult<()> {
        let name = self.global_name(inst)?;
        let value = frame
            .global(&name)
            .ok_or_else(|| TraceError::Unsupported(format!("global '{}' is not defined", name)))?;
        self.state.track(value, AccessPath::Global(name))
    }

    fn load_method(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> TraceResult<()> {
        let name = self.global_name(inst)?;
        let receiver = peek(frame, 0)?;
        let method = receiver
            .get_attr(&name)
            .ok_or_else(|| TraceError::MissingAttribute {
                type_name: receiver.type_name(),
                name: name.clone(),
            })?;
        let path = match self.state.objects().get(&receiver, false)?.access_path() {
            Some(receiver_path) => receiver_path.attr(&name),
            // the method is fixed by the receiver, which needs no guard
            None => return Ok(()),
        };
        self.state
            .track(method, path)
            .map_err(|e| TraceError::Unsupported(format!("exception during LOAD_METHOD {}: {}", name, e)))
    }

    fn call_method(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> TraceResult<()> {
        let argc = inst.arg as usize;
        let args = (0..argc)
            .rev()
            .map(|depth| peek(frame, depth))
            .collect::<TraceResult<Vec<_>>>()?;
        let self_val = peek(frame, argc)?;
        let meth_val = peek(frame, argc + 1)?;
        if meth_val.is_null() {
            self.call_function(&self_val, &args, &[])
        } else {
            let mut full = Vec::with_capacity(argc + 1);
            full.push(self_val);
            full.extend(args);
            self.call_function(&meth_val, &full, &[])
        }
    }

    fn call_function_op(&mut self, frame: &dyn TracedFrame, inst: Instruction) -> TraceResult<()> {
        let argc = inst.arg as usize;
        let args = (0..argc)
            .rev()
            .map(|depth| peek(frame, depth))
            .collect::<TraceResult<Vec<_>>>()?;
        let func = peek(frame, argc)?;
        self.call_function(&func, &args, &[])
    }

    fn store_fast(&mut self, inst: Instruction) -> TraceResult<()> {
        let name = self.local_name(inst)?;
        self.state.store_local(name);
        Ok(())
    }

    /// Classify a call by its arguments:
    /// - any tensor argument: fuse into the graph
    /// - only scalars: pure host computation, nothing to record
    /// - anything else: unsupported
    fn call_function(&mut self, func: &Value, args: &[Value], kwargs: &[(String, Value)]) -> TraceResult<()> {
        let arguments = || itertools::chain(args, kwargs.iter().map(|(_, v)| v));
        if arguments().any(|v| v.as_tensor().is_some()) {
            if let Some(builtin) = func.as_builtin() {
                if !builtin.is_graph_function() {
                    return Err(TraceError::NotImplemented(format!(
                        "{} on tensors stays in the interpreter",
                        builtin
                    )));
                }
            }
            self.state.record_operation(func, args, kwargs)?;
            return Ok(());
        }
        if arguments().all(Value::is_scalar) {
            return Ok(());
        }
        Err(TraceError::Unsupported(format!(
            "unsupported call to {} with arguments ({})",
            func,
            arguments().map(Value::type_name).join(", ")
        )))
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Publish the current trace. No-op when nothing was recorded.
    pub fn commit(&mut self, frame: &dyn TracedFrame) -> Result<(), FatalError> {
        if self.state.is_empty() {
            return Ok(());
        }
        match self.build_record(frame) {
            Ok(record) => {
                self.state.set_empty(true);
                info!(
                    target: "graphtrace::tracker",
                    frame_id = %self.frame_id,
                    key = %record.key,
                    start_pc = record.start_pc,
                    end_pc = record.end_pc,
                    guards = record.guard.len(),
                    nodes = self.state.graph().graph().len(),
                    "commit"
                );
                self.ctx.frame_cache(self.frame_id).add(record);
                self.ctx.record_commit();
                Ok(())
            }
            Err(CommitError::Trace(e)) => {
                self.state.set_empty(true);
                warn!(
                    target: "graphtrace::tracker",
                    frame_id = %self.frame_id,
                    error = %e,
                    "trace abandoned"
                );
                self.ctx.record_abandoned();
                Ok(())
            }
            Err(CommitError::Fatal(e)) => Err(e),
        }
    }

    fn build_record(&self, frame: &dyn TracedFrame) -> Result<CachedGraph, CommitError> {
        let start_pc = self.state.start_pc().ok_or(FatalError::MissingStartPc)?;
        let raw = frame.last_instruction();
        let end_pc = self
            .code
            .translate_to_original_pc(raw)
            .unwrap_or_else(|| self.code.next_original_pc(raw));

        let mut guard = GuardBuilder::new(self.ctx.config().dynshape);
        for var in self.state.objects().variables() {
            var.make_guard(&mut guard);
        }

        // Graph inputs, one per placeholder in graph order
        let graph = self.state.graph().graph();
        let placeholder_paths: HashMap<NodeId, &AccessPath> = self
            .state
            .objects()
            .variables()
            .filter_map(|var| match var {
                Variable::Tensor(t) => var.access_path().map(|path| (t.node(), path)),
                _ => None,
            })
            .collect();
        let mut outputs = GraphFnBuilder::new();
        for node in graph.nodes() {
            if let NodeOp::Placeholder { .. } = node.op {
                if let Some(path) = placeholder_paths.get(&node.id) {
                    outputs.add_graph_input((*path).clone());
                }
            }
        }
        let placeholders = graph.placeholder_count();
        if outputs.inputs().len() != placeholders {
            return Err(FatalError::InputOrderMismatch {
                placeholders,
                inputs: outputs.inputs().len(),
            }
            .into());
        }

        // Locals written by the trace and still read afterwards
        let live = livevars_analysis(self.code.code(), end_pc);
        for (i, name) in live.intersection(self.state.stored_locals()).enumerate() {
            let value = frame
                .local(name)
                .ok_or_else(|| TraceError::UnboundLocal(name.clone()))?;
            let var = self.state.objects().get(&value, true)?;
            var.make_output(&format!("__live_{}", i), StorePos::Local(name.clone()), &mut outputs);
        }

        // Every stack slot, top first
        let end_stack_depth = frame.stack_depth();
        for depth in 0..end_stack_depth {
            let value = peek(frame, depth)?;
            let var = self.state.objects().get(&value, true)?;
            var.make_output(&format!("__stack__{}", depth), StorePos::Stack(depth), &mut outputs);
        }

        let artifact = self.ctx.compiler().compile(graph, outputs.graph_outputs())?;

        if self.ctx.config().debug {
            for clause in guard.clauses() {
                debug!(target: "graphtrace::commit", frame_id = %self.frame_id, %clause, "guard");
            }
            for slot in outputs.slots() {
                debug!(target: "graphtrace::commit", frame_id = %self.frame_id, %slot, "output");
            }
            debug!(target: "graphtrace::commit", frame_id = %self.frame_id, graph = %graph, "graph");
        }

        let return_values = outputs.store_positions();
        Ok(CachedGraph {
            guard: guard.finish(),
            graph_fn: outputs.finish(artifact),
            start_pc,
            end_pc,
            start_stack_depth: self.state.start_stack_depth(),
            end_stack_depth,
            return_values,
            key: self.ctx.new_trace_key(),
        })
    }
}

impl std::fmt::Debug for GuardTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardTracker")
            .field("frame_id", &self.frame_id)
            .field("frame", &self.frame)
            .field("have_error", &self.have_error)
            .field("is_empty", &self.state.is_empty())
            .field("start_pc", &self.state.start_pc())
            .field("last_restart", &self.last_restart)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tracker stack
// ============================================================================

/// One tracker per active frame, innermost last.
#[derive(Debug, Default)]
pub struct TrackerStack {
    trackers: Vec<GuardTracker>,
}

impl TrackerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tracker(
        &mut self,
        frame: &dyn TracedFrame,
        frame_id: FrameId,
        code: Arc<ProcessedCode>,
        ctx: Arc<TracerContext>,
    ) {
        debug!(target: "graphtrace::tracker", %frame_id, depth = self.trackers.len() + 1, "push tracker");
        self.trackers.push(GuardTracker::new(frame, frame_id, code, ctx));
    }

    /// Pop the tracker of a returning frame. Its trace must be committed.
    pub fn pop_tracker(&mut self, frame_id: FrameId) -> Result<GuardTracker, FatalError> {
        let top = self.trackers.last().ok_or(FatalError::NoActiveTracker)?;
        if top.frame_id != frame_id {
            return Err(FatalError::FrameMismatch {
                expected: top.frame_id,
                got: frame_id,
            });
        }
        if !top.is_idle() {
            return Err(FatalError::TrackerNotEmpty(frame_id));
        }
        debug!(target: "graphtrace::tracker", %frame_id, depth = self.trackers.len(), "pop tracker");
        self.trackers.pop().ok_or(FatalError::NoActiveTracker)
    }

    /// Drop the tracker of a frame unwound by an error, without committing.
    pub fn discard(&mut self, frame_id: FrameId) -> Option<GuardTracker> {
        if self.trackers.last().is_some_and(|t| t.frame_id == frame_id) {
            debug!(target: "graphtrace::tracker", %frame_id, "discard tracker");
            self.trackers.pop()
        } else {
            None
        }
    }

    pub fn on_step(&mut self, frame: &dyn TracedFrame, frame_id: FrameId) -> Result<(), FatalError> {
        self.trackers
            .last_mut()
            .ok_or(FatalError::NoActiveTracker)?
            .on_step(frame, frame_id)
    }

    pub fn current(&self) -> Option<&GuardTracker> {
        self.trackers.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut GuardTracker> {
        self.trackers.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn reset(&mut self) {
        self.trackers.clear();
    }
}
