//! Host bytecode interpreter with the tracer hooked in.
//!
//! Each call runs a fresh [`Frame`]. With tracing enabled the frame gets a
//! [`GuardTracker`](crate::tracer::tracker::GuardTracker), and before every
//! instruction the loop does:
//!
//! ```text
//!   tracker idle? ──yes──► cache lookup at (pc, depth)
//!                               │ hit: run graph, write back, jump to end_pc
//!                               ▼
//!   tracker.on_step(frame) ──► step(instruction)
//! ```
//!
//! A cached graph that fails at run time is skipped; the frame is then
//! interpreted as if there had been no record.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::tracer::access::InstructionMap;
use crate::tracer::cache::Lookup;
use crate::tracer::context::TracerContext;
use crate::tracer::tracker::TrackerStack;

use super::code::{CodeObject, FrameId, Instruction, ProcessedCode};
use super::frame::{Frame, FrameHandle};
use super::opcodes::Opcode;
use super::ops;
use super::types::{VmConfig, VmError, VmResult};
use super::value::{Builtin, Object, SliceValue, Value};

pub struct Interpreter {
    ctx: Arc<TracerContext>,
    trackers: TrackerStack,
    globals: Arc<HashMap<String, Value>>,
    /// Code object address -> processed code
    codes: HashMap<usize, Arc<ProcessedCode>>,
    config: VmConfig,
    next_handle: u64,
    call_depth: usize,
}

impl Interpreter {
    pub fn new(ctx: Arc<TracerContext>) -> Self {
        Self::with_config(ctx, VmConfig::default())
    }

    pub fn with_config(ctx: Arc<TracerContext>, config: VmConfig) -> Self {
        Self {
            ctx,
            trackers: TrackerStack::new(),
            globals: Arc::new(HashMap::new()),
            codes: HashMap::new(),
            config,
            next_handle: 1,
            call_depth: 0,
        }
    }

    pub fn context(&self) -> &Arc<TracerContext> {
        &self.ctx
    }

    pub fn trackers(&self) -> &TrackerStack {
        &self.trackers
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.globals).insert(name.into(), value);
    }

    pub fn globals(&self) -> &HashMap<String, Value> {
        &self.globals
    }

    // === Code preparation ===

    /// Processed form of `code`, created with a fresh frame id on first use.
    pub fn prepare(&mut self, code: &Arc<CodeObject>) -> Arc<ProcessedCode> {
        let ctx = &self.ctx;
        let processed = self
            .codes
            .entry(Arc::as_ptr(code) as usize)
            .or_insert_with(|| Arc::new(ProcessedCode::new(ctx.next_frame_id(), Arc::clone(code))));
        Arc::clone(processed)
    }

    /// Re-prepare `code` with injected instructions. The result gets a new
    /// frame id and replaces any earlier preparation.
    pub fn prepare_with_injected(
        &mut self,
        code: &Arc<CodeObject>,
        injected: &[(usize, Instruction)],
    ) -> Arc<ProcessedCode> {
        let processed = Arc::new(ProcessedCode::with_injected(
            self.ctx.next_frame_id(),
            Arc::clone(code),
            injected,
        ));
        self.codes.insert(Arc::as_ptr(code) as usize, Arc::clone(&processed));
        processed
    }

    pub fn frame_id_of(&self, code: &Arc<CodeObject>) -> Option<FrameId> {
        self.codes.get(&(Arc::as_ptr(code) as usize)).map(|p| p.id())
    }

    // === Calls ===

    /// Run a code object as a function
    pub fn run_code(&mut self, code: &Arc<CodeObject>, args: &[Value]) -> VmResult<Value> {
        let processed = self.prepare(code);
        self.run_frame(processed, args)
    }

    /// Call any callable value.
    ///
    /// Modules with a `forward` run it with the module bound as the first
    /// argument; the module becomes the frame root of that code the first
    /// time.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> VmResult<Value> {
        match callee.object() {
            Object::Builtin(builtin) => ops::call_builtin(*builtin, args),
            Object::Module(module) => match module.forward() {
                Some(code) => {
                    let processed = self.prepare(code);
                    self.ctx.set_frame_root_if_absent(processed.id(), callee);
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(callee.clone());
                    full.extend_from_slice(args);
                    self.run_frame(processed, &full)
                }
                None => ops::call_module(module, args),
            },
            Object::Function(code) => {
                let processed = self.prepare(code);
                self.run_frame(processed, args)
            }
            _ => Err(VmError::NotCallable(callee.type_name())),
        }
    }

    fn run_frame(&mut self, code: Arc<ProcessedCode>, args: &[Value]) -> VmResult<Value> {
        if self.call_depth >= self.config.max_call_depth {
            return Err(VmError::CallStackOverflow);
        }
        let params = code.code().params();
        if params.len() != args.len() {
            return Err(VmError::ArityMismatch {
                expected: params.len(),
                got: args.len(),
            });
        }

        let handle = FrameHandle::new(self.next_handle);
        self.next_handle += 1;
        let mut frame = Frame::new(handle, Arc::clone(&code), Arc::clone(&self.globals));
        for (name, value) in params.iter().zip(args) {
            frame.set_local(name.clone(), value.clone());
        }

        let frame_id = code.id();
        let tracing = self.ctx.config().enabled;
        if tracing {
            self.trackers
                .push_tracker(&frame, frame_id, Arc::clone(&code), Arc::clone(&self.ctx));
        }

        self.call_depth += 1;
        let result = self.execute(&mut frame, tracing);
        self.call_depth -= 1;

        if tracing {
            match &result {
                Ok(_) => {
                    self.trackers.pop_tracker(frame_id)?;
                }
                Err(_) => {
                    self.trackers.discard(frame_id);
                }
            }
        }
        result
    }

    fn execute(&mut self, frame: &mut Frame, tracing: bool) -> VmResult<Value> {
        let frame_id = frame.code().id();
        loop {
            if tracing {
                self.try_cached(frame)?;
            }

            let ip = frame.ip();
            let Some(inst) = frame.code().raw_instruction(ip) else {
                // Fell off the end: implicit `return None`
                if let Some(tracker) = self.trackers.current_mut().filter(|_| tracing) {
                    tracker.commit(&*frame)?;
                }
                return Ok(Value::none());
            };

            if tracing {
                self.trackers.on_step(&*frame, frame_id)?;
            }

            if self.config.trace {
                let text = match frame.code().translate_to_original_pc(ip) {
                    Some(pc) => frame.code().code().disassemble_instruction(pc),
                    None => format!("   - {} (injected)", inst),
                };
                trace!(target: "graphtrace::vm", %frame_id, ip, depth = frame.stack_depth(), "{}", text);
            }

            frame.advance();
            if let ControlFlow::Break(value) = self.step(frame, inst)? {
                return Ok(value);
            }
        }
    }

    /// Run a cached graph if the tracker is between traces and a record at
    /// the current position has a passing guard.
    fn try_cached(&mut self, frame: &mut Frame) -> VmResult<()> {
        if !self.trackers.current().is_some_and(|t| t.is_idle()) {
            return Ok(());
        }
        let code = Arc::clone(frame.code());
        let Some(pc) = code.translate_to_original_pc(frame.ip()) else {
            return Ok(());
        };
        let Some(cache) = self.ctx.cache().get(code.id()) else {
            return Ok(());
        };

        let record = match cache.lookup(pc, frame.stack_depth(), &*frame) {
            Lookup::Hit(record) => record,
            Lookup::GuardFailed => {
                self.ctx.record_guard_failure();
                debug!(target: "graphtrace::vm", frame_id = %code.id(), pc, "guard failed");
                return Ok(());
            }
            Lookup::NoEntry => return Ok(()),
        };

        let values = match record.run(&*frame) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    target: "graphtrace::vm",
                    key = %record.key,
                    error = %e,
                    "cached graph failed, interpreting"
                );
                return Ok(());
            }
        };

        frame.apply_outputs(&record.return_values, values, record.end_stack_depth)?;
        frame.jump_to(record.end_pc)?;
        self.ctx.record_hit();
        debug!(
            target: "graphtrace::vm",
            frame_id = %code.id(),
            key = %record.key,
            start_pc = record.start_pc,
            end_pc = record.end_pc,
            "cache hit"
        );
        if let Some(tracker) = self.trackers.current_mut() {
            tracker.resync();
        }
        Ok(())
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn step(&mut self, frame: &mut Frame, inst: Instruction) -> VmResult<ControlFlow<Value>> {
        let code = Arc::clone(frame.code());
        let code = code.code();
        let varname = |arg: u32| code.varname(arg).ok_or(VmError::InvalidName(arg));
        let name_at = |arg: u32| code.name_at(arg).ok_or(VmError::InvalidName(arg));

        match inst.opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                frame.pop()?;
            }

            Opcode::LoadConst => {
                let value = code
                    .constant(inst.arg)
                    .cloned()
                    .ok_or(VmError::InvalidConstant(inst.arg))?;
                frame.push(value);
            }
            Opcode::LoadFast => {
                let name = varname(inst.arg)?;
                let value = frame
                    .get_local(name)
                    .cloned()
                    .ok_or_else(|| VmError::UnboundLocal(name.to_string()))?;
                frame.push(value);
            }
            Opcode::StoreFast => {
                let name = varname(inst.arg)?;
                let value = frame.pop()?;
                frame.set_local(name, value);
            }
            Opcode::LoadGlobal => {
                let name = name_at(inst.arg)?;
                let value = frame
                    .globals()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::UnknownGlobal(name.to_string()))?;
                frame.push(value);
            }
            Opcode::LoadAttr => {
                let name = name_at(inst.arg)?;
                let object = frame.pop()?;
                frame.push(get_attr(&object, name)?);
            }
            Opcode::LoadMethod => {
                let name = name_at(inst.arg)?;
                let receiver = frame.pop()?;
                match (receiver.as_tensor(), Builtin::from_method(name)) {
                    (Some(_), Some(method)) => {
                        frame.push(Value::builtin(method));
                        frame.push(receiver);
                    }
                    _ => {
                        let attr = get_attr(&receiver, name)?;
                        frame.push(Value::null());
                        frame.push(attr);
                    }
                }
            }

            Opcode::CallFunction => {
                let args = frame.pop_n(inst.arg as usize)?;
                let callee = frame.pop()?;
                let result = self.call(&callee, &args)?;
                frame.push(result);
            }
            Opcode::CallMethod => {
                let args = frame.pop_n(inst.arg as usize)?;
                let self_or_callee = frame.pop()?;
                let method = frame.pop()?;
                let result = if method.is_null() {
                    self.call(&self_or_callee, &args)?
                } else {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(self_or_callee);
                    full.extend(args);
                    self.call(&method, &full)?
                };
                frame.push(result);
            }

            Opcode::BinaryAdd => self.binary(frame, Builtin::Add)?,
            Opcode::BinarySubtract => self.binary(frame, Builtin::Sub)?,
            Opcode::BinaryMultiply => self.binary(frame, Builtin::Mul)?,
            Opcode::BinaryTrueDivide => self.binary(frame, Builtin::TrueDiv)?,
            Opcode::BinarySubscr => self.binary(frame, Builtin::GetItem)?,
            Opcode::UnaryNegative => {
                let operand = frame.pop()?;
                frame.push(ops::call_builtin(Builtin::Neg, &[operand])?);
            }
            Opcode::BuildSlice => {
                let parts = frame.pop_n(inst.arg as usize)?;
                frame.push(Value::slice(build_slice(&parts)?));
            }

            Opcode::JumpAbsolute => frame.jump_to(inst.arg as usize)?,
            Opcode::PopJumpIfFalse => {
                let cond = frame.pop()?;
                let truth = cond.truthy().ok_or(VmError::TypeError {
                    expected: "value with a truth value",
                    got: cond.type_name(),
                })?;
                if !truth {
                    frame.jump_to(inst.arg as usize)?;
                }
            }
            Opcode::ReturnValue => return Ok(ControlFlow::Break(frame.pop()?)),
        }

        if frame.stack_depth() > self.config.max_value_stack {
            return Err(VmError::ValueStackOverflow);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn binary(&mut self, frame: &mut Frame, op: Builtin) -> VmResult<()> {
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        frame.push(ops::call_builtin(op, &[lhs, rhs])?);
        Ok(())
    }
}

fn get_attr(object: &Value, name: &str) -> VmResult<Value> {
    object.get_attr(name).ok_or_else(|| VmError::AttributeError {
        type_name: object.type_name(),
        name: name.to_string(),
    })
}

fn build_slice(parts: &[Value]) -> VmResult<SliceValue> {
    let bound = |v: &Value| -> VmResult<Option<i64>> {
        match v.object() {
            Object::None => Ok(None),
            Object::Int(i) => Ok(Some(*i)),
            _ => Err(VmError::TypeError {
                expected: "int or None",
                got: v.type_name(),
            }),
        }
    };
    match parts {
        [start, stop] => Ok(SliceValue {
            start: bound(start)?,
            stop: bound(stop)?,
            step: None,
        }),
        [start, stop, step] => Ok(SliceValue {
            start: bound(start)?,
            stop: bound(stop)?,
            step: bound(step)?,
        }),
        _ => Err(VmError::ArityMismatch {
            expected: 2,
            got: parts.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::host::code::CodeBuilder;
    use crate::host::tensor::Tensor;
    use crate::host::value::Module;

    fn plain() -> Interpreter {
        Interpreter::new(TracerContext::shared(TracerConfig::disabled()))
    }

    #[test]
    fn test_scalar_function() {
        let mut b = CodeBuilder::new("add").with_params(&["a", "b"]);
        b.load_fast("a");
        b.load_fast("b");
        b.emit(Opcode::BinaryAdd);
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();

        let mut vm = plain();
        let r = vm.run_code(&code, &[Value::int(2), Value::int(40)]).unwrap();
        assert_eq!(r.as_int(), Some(42));
    }

    #[test]
    fn test_countdown_loop() {
        // i = n; while i: i = i - 1; return i
        let mut b = CodeBuilder::new("countdown").with_params(&["n"]);
        b.load_fast("n");
        b.store_fast("i");
        let top = b.current_pc();
        b.load_fast("i");
        let exit = b.emit_jump(Opcode::PopJumpIfFalse);
        b.load_fast("i");
        b.load_const(Value::int(1));
        b.emit(Opcode::BinarySubtract);
        b.store_fast("i");
        b.emit_jump_to(Opcode::JumpAbsolute, top);
        b.patch_jump(exit);
        b.load_fast("i");
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();

        let mut vm = plain();
        assert_eq!(vm.run_code(&code, &[Value::int(5)]).unwrap().as_int(), Some(0));

        // The same loop under the tracer, logging every step, gives the same answer
        let mut traced = Interpreter::with_config(
            TracerContext::shared(TracerConfig::default()),
            VmConfig::default().with_trace(),
        );
        assert_eq!(traced.run_code(&code, &[Value::int(5)]).unwrap().as_int(), Some(0));
        assert!(traced.trackers().is_empty());
    }

    #[test]
    fn test_tensor_method_and_module_call() {
        let mut b = CodeBuilder::new("forward").with_params(&["self", "x"]);
        b.load_fast("self");
        b.load_method("act");
        b.load_fast("x");
        b.call_method(1);
        b.load_method("neg");
        b.call_method(0);
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();

        let model = Value::module(
            Module::container("model", code).with_child("act", Value::module(Module::relu())),
        );
        let x = Value::tensor(Tensor::from_vec(&[3], vec![-1.0, 0.5, 2.0]).unwrap());

        let mut vm = plain();
        let r = vm.call(&model, &[x]).unwrap();
        assert_eq!(r.as_tensor().unwrap().data(), &[-0.0, -0.5, -2.0]);
    }

    #[test]
    fn test_slice_subscript() {
        let mut b = CodeBuilder::new("head").with_params(&["x"]);
        b.load_fast("x");
        b.load_const(Value::none());
        b.load_const(Value::int(2));
        b.emit_arg(Opcode::BuildSlice, 2);
        b.emit(Opcode::BinarySubscr);
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();

        let x = Value::tensor(Tensor::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        let r = plain().run_code(&code, &[x]).unwrap();
        assert_eq!(r.as_tensor().unwrap().shape(), &[2]);
    }

    #[test]
    fn test_errors() {
        let mut b = CodeBuilder::new("f");
        b.load_global("missing");
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();
        let mut vm = plain();
        assert!(matches!(vm.run_code(&code, &[]), Err(VmError::UnknownGlobal(_))));
        assert!(matches!(
            vm.run_code(&code, &[Value::int(1)]),
            Err(VmError::ArityMismatch { expected: 0, got: 1 })
        ));
        assert!(matches!(vm.call(&Value::int(1), &[]), Err(VmError::NotCallable("int"))));
    }

    #[test]
    fn test_falls_off_end() {
        let mut b = CodeBuilder::new("noop");
        b.emit(Opcode::Nop);
        let code = b.build_arc();
        let mut vm = Interpreter::new(TracerContext::shared(TracerConfig::default()));
        assert!(vm.run_code(&code, &[]).unwrap().is_none());
    }

    #[test]
    fn test_recursion_limit() {
        let mut b = CodeBuilder::new("recurse");
        b.load_global("recurse");
        b.call_function(0);
        b.emit(Opcode::ReturnValue);
        let code = b.build_arc();
        let mut vm = Interpreter::with_config(
            TracerContext::shared(TracerConfig::default()),
            VmConfig {
                max_call_depth: 8,
                ..VmConfig::default()
            },
        );
        vm.set_global("recurse", Value::function(Arc::clone(&code)));
        assert!(matches!(vm.run_code(&code, &[]), Err(VmError::CallStackOverflow)));
        assert!(vm.trackers().is_empty());
    }
}
