//! Tracer state and tracker tests driven by hand-built frames.
//!
//! These tests step a [`GuardTracker`] directly and mutate the frame the way
//! the interpreter would, so each transition can be checked in isolation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TracerConfig;
use crate::host::code::{CodeBuilder, CodeObject, FrameId, ProcessedCode};
use crate::host::frame::{Frame, FrameHandle};
use crate::host::opcodes::Opcode;
use crate::host::tensor::Tensor;
use crate::host::value::{Builtin, Module, ModuleKind, Value};

use super::access::AccessPath;
use super::context::TracerContext;
use super::error::{FatalError, TraceError};
use super::graph::{NodeOp, Operand};
use super::state::TracerState;
use super::tracker::{GuardTracker, TrackerStack};
use super::variables::Variable;

// ============================================================================
// Helpers
// ============================================================================

fn tensor(shape: &[usize]) -> Value {
    let numel = shape.iter().product();
    Value::tensor(Tensor::from_vec(shape, vec![1.0; numel]).unwrap())
}

fn frame_for(code: Arc<CodeObject>, id: u64) -> Frame {
    let processed = Arc::new(ProcessedCode::new(FrameId::new(id), code));
    Frame::new(FrameHandle::new(id), processed, Arc::new(HashMap::new()))
}

fn tracker_for(frame: &Frame, ctx: &Arc<TracerContext>) -> GuardTracker {
    let code = Arc::clone(frame.code());
    GuardTracker::new(frame, code.id(), code, Arc::clone(ctx))
}

fn ctx() -> Arc<TracerContext> {
    TracerContext::shared(TracerConfig::default())
}

// ============================================================================
// TracerState
// ============================================================================

#[test]
fn test_state_reads_stack_slots() {
    let mut frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    let x = tensor(&[2, 3]);
    frame.push(x.clone());
    frame.push(Value::int(4));

    let state = TracerState::from_frame(&frame, true, &Value::none()).unwrap();
    assert_eq!(state.objects().len(), 2);
    assert_eq!(state.graph().graph().placeholder_count(), 1);
    assert_eq!(state.start_stack_depth(), 2);
    assert_eq!(
        state.objects().get(&x, false).unwrap().access_path(),
        Some(&AccessPath::Stack(1))
    );
    assert!(state.is_empty());
}

#[test]
fn test_state_shared_stack_value_wrapped_once() {
    let mut frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    let x = tensor(&[4]);
    frame.push(x.clone());
    frame.push(x.clone());

    let state = TracerState::from_frame(&frame, true, &Value::none()).unwrap();
    assert_eq!(state.objects().len(), 1);
    assert_eq!(state.graph().graph().placeholder_count(), 1);

    let skipped = TracerState::from_frame(&frame, false, &Value::none()).unwrap();
    assert!(skipped.objects().is_empty());
}

#[test]
fn test_state_rejects_unknown_stack_value() {
    let mut frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    frame.push(Value::opaque("socket"));
    let err = TracerState::from_frame(&frame, true, &Value::none()).unwrap_err();
    assert!(matches!(err, TraceError::UnknownType("object")));
}

#[test]
fn test_record_and_resolve() {
    let mut frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    let mut state = TracerState::new(&Value::none(), 0);
    let x = tensor(&[3]);
    state.track(x.clone(), AccessPath::local("x")).unwrap();

    let node = state
        .record_operation(&Value::builtin(Builtin::Mul), &[x.clone(), Value::float(2.0)], &[])
        .unwrap();
    assert_eq!(state.pending_len(), 1);
    let recorded = state.graph().graph().node(node).unwrap();
    assert_eq!(recorded.op, NodeOp::CallFunction(Builtin::Mul));
    assert!(matches!(recorded.args[1], Operand::Literal(_)));

    let y = tensor(&[3]);
    frame.push(y.clone());
    state.resolve_pending(&frame).unwrap();
    assert_eq!(state.pending_len(), 0);
    match &*state.objects().get(&y, false).unwrap() {
        Variable::Tensor(t) => assert_eq!(t.node(), node),
        other => panic!("expected tensor variable, got {}", other.kind()),
    }
    assert!(!state.objects().get(&y, false).unwrap().need_guard_check());
}

#[test]
fn test_resolve_non_tensor_result() {
    let mut frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    let mut state = TracerState::new(&Value::none(), 0);
    let x = tensor(&[3]);
    state.track(x.clone(), AccessPath::local("x")).unwrap();
    state
        .record_operation(&Value::builtin(Builtin::Relu), &[x], &[])
        .unwrap();

    frame.push(Value::int(3));
    let err = state.resolve_pending(&frame).unwrap_err();
    assert!(matches!(err, TraceError::UnsupportedResult("int")));
    assert_eq!(state.pending_len(), 0);
}

#[test]
fn test_record_module_calls() {
    let fc = Value::module(Module::relu());
    let block = Value::module(Module::new(
        "block",
        ModuleKind::Container { forward: None },
    ));
    let root = Value::module(
        Module::new("root", ModuleKind::Container { forward: None })
            .with_child("fc", fc.clone())
            .with_child("block", block.clone()),
    );
    let mut state = TracerState::new(&root, 0);
    let x = tensor(&[2]);
    state.track(x.clone(), AccessPath::local("x")).unwrap();

    let node = state.record_operation(&fc, &[x.clone()], &[]).unwrap();
    assert_eq!(
        state.graph().graph().node(node).unwrap().op,
        NodeOp::CallModule { path: "fc".into() }
    );
    assert_eq!(state.submodule_path(&fc), Some("fc"));

    let err = state.record_operation(&block, &[x.clone()], &[]).unwrap_err();
    assert!(matches!(err, TraceError::NotImplemented(_)));

    let stranger = Value::module(Module::relu());
    let err = state.record_operation(&stranger, &[x], &[]).unwrap_err();
    assert!(err.to_string().contains("outside the frame root"));
}

#[test]
fn test_record_with_untracked_tensor_operand() {
    let mut state = TracerState::new(&Value::none(), 0);
    let err = state
        .record_operation(&Value::builtin(Builtin::Relu), &[tensor(&[2])], &[])
        .unwrap_err();
    assert!(matches!(err, TraceError::MissingObject(_)));
}

// ============================================================================
// GuardTracker
// ============================================================================

#[test]
fn test_unsupported_call_on_empty_trace() {
    let mut b = CodeBuilder::new("f");
    b.call_function(1);
    b.emit(Opcode::ReturnValue);
    let mut frame = frame_for(b.build_arc(), 1);
    frame.push(Value::builtin(Builtin::Len));
    frame.push(Value::tuple(vec![Value::int(1), Value::int(2)]));

    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();

    assert_eq!(
        tracker.last_restart(),
        Some("unsupported call to <built-in len> with arguments (tuple)")
    );
    assert!(tracker.have_error());
    assert_eq!(ctx.cache().record_count(FrameId::new(1)), 0);
    assert_eq!(ctx.stats().restarts, 1);
    assert_eq!(ctx.stats().abandoned, 0);
}

#[test]
fn test_frame_and_handle_mismatch_are_fatal() {
    let mut b = CodeBuilder::new("f");
    b.emit(Opcode::Nop);
    let code = b.build_arc();
    let frame = frame_for(Arc::clone(&code), 1);
    let other = frame_for(code, 2);

    let mut tracker = tracker_for(&frame, &ctx());
    assert_eq!(
        tracker.on_step(&frame, FrameId::new(9)),
        Err(FatalError::FrameMismatch {
            expected: FrameId::new(1),
            got: FrameId::new(9),
        })
    );
    assert!(matches!(
        tracker.on_step(&other, FrameId::new(1)),
        Err(FatalError::HandleMismatch { .. })
    ));
}

#[test]
fn test_force_break_on_method_load_is_fatal() {
    let mut b = CodeBuilder::new("f").with_params(&["x"]);
    b.load_fast("x");
    b.load_method("relu");
    let mut frame = frame_for(b.build_arc(), 1);
    frame.set_local("x", tensor(&[2]));

    let ctx = ctx();
    ctx.add_force_graph_break(FrameId::new(1), 1);
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();

    frame.push(tensor(&[2]));
    frame.set_ip(1);
    assert_eq!(
        tracker.on_step(&frame, FrameId::new(1)),
        Err(FatalError::ForceBreakOnMethodLoad { pc: 1 })
    );
}

#[test]
fn test_force_break_restarts_and_commits() {
    let mut b = CodeBuilder::new("f").with_params(&["x"]);
    b.load_fast("x");
    b.emit(Opcode::Nop);
    b.emit(Opcode::ReturnValue);
    let mut frame = frame_for(b.build_arc(), 1);
    let x = tensor(&[2]);
    frame.set_local("x", x.clone());

    let ctx = ctx();
    ctx.add_force_graph_break(FrameId::new(1), 1);
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();
    assert!(!tracker.is_idle());

    frame.push(x);
    frame.set_ip(1);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();
    assert_eq!(tracker.last_restart(), Some("force graph break (pc = 1)"));
    assert!(tracker.is_idle());

    let records = ctx.frame_cache(FrameId::new(1)).records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].start_pc, 0);
    assert_eq!(records[0].end_pc, 1);
    assert_eq!(records[0].end_stack_depth, 1);
    assert_eq!(records[0].guard.len(), 1);
}

#[test]
fn test_load_method_guard_paths() {
    let fc = Value::module(Module::relu());
    let mut b = CodeBuilder::new("forward").with_params(&["self"]);
    b.load_fast("self");
    b.load_method("fc");
    let code = b.build_arc();
    let model = Value::module(Module::container("model", Arc::clone(&code)).with_child("fc", fc.clone()));

    let ctx = ctx();
    ctx.set_frame_root(FrameId::new(1), model.clone());
    let mut frame = frame_for(code, 1);
    frame.set_local("self", model.clone());

    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();
    frame.push(model);
    frame.set_ip(1);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();

    let var = tracker.state().objects().get(&fc, false).unwrap();
    assert_eq!(var.access_path(), Some(&AccessPath::local("self").attr("fc")));
}

#[test]
fn test_load_method_on_derived_receiver_is_not_guarded() {
    let mut b = CodeBuilder::new("f").with_params(&["x"]);
    b.load_fast("x");
    b.load_method("relu");
    b.call_method(0);
    b.load_method("neg");
    let mut frame = frame_for(b.build_arc(), 1);
    let x = tensor(&[2]);
    frame.set_local("x", x.clone());

    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    let id = FrameId::new(1);

    tracker.on_step(&frame, id).unwrap(); // LOAD_FAST x
    frame.push(x.clone());
    frame.set_ip(1);
    tracker.on_step(&frame, id).unwrap(); // LOAD_METHOD relu
    frame.pop().unwrap();
    frame.push(Value::builtin(Builtin::Relu));
    frame.push(x.clone());
    frame.set_ip(2);
    tracker.on_step(&frame, id).unwrap(); // CALL_METHOD 0
    assert_eq!(tracker.state().pending_len(), 1);

    frame.pop_n(2).unwrap();
    let y = tensor(&[2]);
    frame.push(y.clone());
    frame.set_ip(3);
    tracker.on_step(&frame, id).unwrap(); // LOAD_METHOD neg

    assert!(tracker.last_restart().is_none());
    let tracked_builtins = tracker
        .state()
        .objects()
        .iter()
        .filter(|(value, _)| value.as_builtin().is_some())
        .count();
    // relu was reached through a guarded receiver, neg through a derived one
    assert_eq!(tracked_builtins, 1);
    assert!(!tracker.state().objects().get(&y, false).unwrap().need_guard_check());
}

#[test]
fn test_unknown_opcode_restarts() {
    let mut b = CodeBuilder::new("f");
    b.emit_jump_to(Opcode::JumpAbsolute, 0);
    let frame = frame_for(b.build_arc(), 1);
    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();
    assert_eq!(tracker.last_restart(), Some("unknown opcode JUMP_ABSOLUTE"));
}

#[test]
fn test_init_failure_restarts() {
    let mut b = CodeBuilder::new("f");
    b.emit(Opcode::Nop);
    b.emit(Opcode::Nop);
    let mut frame = frame_for(b.build_arc(), 1);
    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.resync();

    frame.push(Value::opaque("file handle"));
    tracker.on_step(&frame, FrameId::new(1)).unwrap();
    assert!(tracker
        .last_restart()
        .is_some_and(|r| r.starts_with("exception during init")));
    assert!(tracker.have_error());
}

#[test]
fn test_commit_is_idempotent_when_empty() {
    let frame = frame_for(CodeBuilder::new("f").build_arc(), 1);
    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.commit(&frame).unwrap();
    tracker.commit(&frame).unwrap();
    assert_eq!(ctx.cache().total_records(), 0);
    assert_eq!(ctx.stats().commits, 0);
}

#[test]
fn test_commit_abandons_unreproducible_stack() {
    let mut b = CodeBuilder::new("f");
    b.load_const(Value::tuple(vec![]));
    b.emit(Opcode::Nop);
    let mut frame = frame_for(b.build_arc(), 1);
    let ctx = ctx();
    let mut tracker = tracker_for(&frame, &ctx);
    tracker.on_step(&frame, FrameId::new(1)).unwrap();

    frame.push(Value::tuple(vec![]));
    frame.set_ip(1);
    tracker.commit(&frame).unwrap();
    assert!(tracker.is_idle());
    assert_eq!(ctx.cache().total_records(), 0);
    assert_eq!(ctx.stats().abandoned, 1);
}

// ============================================================================
// TrackerStack
// ============================================================================

#[test]
fn test_tracker_stack_lifecycle() {
    let mut b = CodeBuilder::new("f").with_params(&["x"]);
    b.load_fast("x");
    let code = b.build_arc();
    let mut frame = frame_for(code, 1);
    frame.set_local("x", Value::int(1));
    let processed = Arc::clone(frame.code());

    let ctx = ctx();
    let mut stack = TrackerStack::new();
    assert_eq!(stack.pop_tracker(FrameId::new(1)).unwrap_err(), FatalError::NoActiveTracker);
    assert_eq!(stack.on_step(&frame, FrameId::new(1)), Err(FatalError::NoActiveTracker));

    stack.push_tracker(&frame, FrameId::new(1), processed, Arc::clone(&ctx));
    stack.on_step(&frame, FrameId::new(1)).unwrap();
    assert_eq!(stack.depth(), 1);

    // mid-trace pop is a consistency violation
    assert_eq!(
        stack.pop_tracker(FrameId::new(1)).unwrap_err(),
        FatalError::TrackerNotEmpty(FrameId::new(1))
    );
    assert!(matches!(
        stack.pop_tracker(FrameId::new(2)),
        Err(FatalError::FrameMismatch { .. })
    ));

    assert!(stack.discard(FrameId::new(2)).is_none());
    assert!(stack.discard(FrameId::new(1)).is_some());
    assert!(stack.is_empty());
}
