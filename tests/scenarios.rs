//! End-to-end tracer scenarios through the interpreter.

mod common;

use std::sync::Arc;

use common::*;
use graphtrace::host::{Builtin, CodeBuilder, Module, Opcode, Value};
use graphtrace::tracer::StorePos;

#[test]
fn test_scalar_addition_miss_then_hit() {
    let (ctx, mut vm) = traced();
    let code = add_fn();

    let first = vm.run_code(&code, &[Value::int(1), Value::int(2)]).unwrap();
    assert_eq!(first.as_int(), Some(3));
    assert_eq!(ctx.stats().cache_hits, 0);

    let recs = records(&ctx, &vm, &code);
    assert_eq!(recs.len(), 1);
    let clauses: Vec<String> = recs[0].guard.clauses().iter().map(|c| c.to_string()).collect();
    assert_eq!(clauses, vec![r#"locals["a"] == 1"#, r#"locals["b"] == 2"#]);

    let second = vm.run_code(&code, &[Value::int(1), Value::int(2)]).unwrap();
    assert_eq!(second.as_int(), Some(3));
    assert_eq!(ctx.stats().cache_hits, 1);
    assert_eq!(ctx.stats().commits, 1);
    assert_eq!(records(&ctx, &vm, &code).len(), 1);
}

#[test]
fn test_unsupported_structured_argument() {
    // len((1, 2)): no tensor and not all scalars
    let mut b = CodeBuilder::new("count");
    b.load_global("len");
    b.load_const(Value::tuple(vec![Value::int(1), Value::int(2)]));
    b.call_function(1);
    b.emit(Opcode::ReturnValue);
    let code = b.build_arc();

    let (ctx, mut vm) = traced();
    vm.set_global("len", Value::builtin(Builtin::Len));
    let r = vm.run_code(&code, &[]).unwrap();
    assert_eq!(r.as_int(), Some(2));

    // The partial trace left a tuple on the stack, which no record can rebuild
    assert!(records(&ctx, &vm, &code).is_empty());
    assert_eq!(ctx.stats().abandoned, 1);
    assert_eq!(ctx.stats().commits, 0);
}

#[test]
fn test_shared_input_guarded_once() {
    // (x + x) * x
    let mut b = CodeBuilder::new("cube_ish").with_params(&["x"]);
    b.load_fast("x");
    b.load_fast("x");
    b.emit(Opcode::BinaryAdd);
    b.load_fast("x");
    b.emit(Opcode::BinaryMultiply);
    b.emit(Opcode::ReturnValue);
    let code = b.build_arc();

    let (ctx, mut vm) = traced();
    let x = tensor(&[2, 2], 0.3);
    vm.run_code(&code, &[x]).unwrap();

    let recs = records(&ctx, &vm, &code);
    assert_eq!(recs.len(), 1);
    let guard = &recs[0].guard;
    assert_eq!(guard.len(), 1);
    assert_eq!(
        guard.clauses()[0].to_string(),
        r#"check_tensor(locals["x"], float32, [2, 2])"#
    );
}

#[test]
fn test_force_break_splits_trace() {
    let (ctx, mut vm) = traced();
    let code = affine_fn();
    let id = vm.prepare(&code).id();
    ctx.add_force_graph_break(id, 2);

    let x = tensor(&[3], 0.5);
    let expected = data(&plain().run_code(&code, &[x.clone()]).unwrap());
    assert_eq!(data(&vm.run_code(&code, &[x.clone()]).unwrap()), expected);

    let recs = records(&ctx, &vm, &code);
    let bounds: Vec<(usize, usize)> = recs.iter().map(|r| (r.start_pc, r.end_pc)).collect();
    assert_eq!(bounds, vec![(0, 2), (3, 5)]);
    assert_eq!(recs[0].end_stack_depth, 2);
    assert_eq!(recs[1].start_stack_depth, 1);

    // Both halves replay; the forced instruction is interpreted in between
    assert_eq!(data(&vm.run_code(&code, &[x]).unwrap()), expected);
    assert_eq!(ctx.stats().cache_hits, 2);
}

#[test]
fn test_return_ends_trace_at_return_pc() {
    let (ctx, mut vm) = traced();
    let code = add_fn();
    vm.run_code(&code, &[Value::float(0.5), Value::float(0.25)]).unwrap();

    let recs = records(&ctx, &vm, &code);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].start_pc, 0);
    assert_eq!(recs[0].end_pc, 3);
    assert_eq!(code.instruction(3).map(|i| i.opcode), Some(Opcode::ReturnValue));
    assert_eq!(recs[0].end_stack_depth, 1);
}

#[test]
fn test_break_before_method_call_keeps_null_slot() {
    // forward(self, x): return self.act(x + 1.0)
    let mut b = CodeBuilder::new("Shifted.forward").with_params(&["self", "x"]);
    b.load_fast("self");
    b.load_method("act");
    b.load_fast("x");
    b.load_const(Value::float(1.0));
    b.emit(Opcode::BinaryAdd);
    let call = b.call_method(1);
    b.emit(Opcode::ReturnValue);
    let code = b.build_arc();
    let model = Value::module(
        Module::container("Shifted", Arc::clone(&code)).with_child("act", Value::module(Module::relu())),
    );

    let (ctx, mut vm) = traced();
    let id = vm.prepare(&code).id();
    ctx.add_force_graph_break(id, call);

    let x = tensor(&[2, 3], 1.3);
    let expected = data(&plain().call(&model, &[x.clone()]).unwrap());
    assert_eq!(data(&vm.call(&model, &[x.clone()]).unwrap()), expected);

    // NULL, the bound method and x + 1.0 are all reproduced
    let recs = records(&ctx, &vm, &code);
    assert_eq!((recs[0].start_pc, recs[0].end_pc), (0, call));
    assert_eq!(recs[0].end_stack_depth, 3);
    assert_eq!(ctx.stats().abandoned, 0);

    assert_eq!(data(&vm.call(&model, &[x]).unwrap()), expected);
    assert!(ctx.stats().cache_hits >= 1);
}

#[test]
fn test_stored_local_written_back_on_hit() {
    // y = x * 2.0; return y + y
    let mut b = CodeBuilder::new("double_twice").with_params(&["x"]);
    b.load_fast("x");
    b.load_const(Value::float(2.0));
    b.emit(Opcode::BinaryMultiply);
    b.store_fast("y");
    let reload = b.load_fast("y");
    b.load_fast("y");
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = b.build_arc();

    let (ctx, mut vm) = traced();
    let id = vm.prepare(&code).id();
    ctx.add_force_graph_break(id, reload);
    vm.run_code(&code, &[tensor(&[4], 0.5)]).unwrap();

    let recs = records(&ctx, &vm, &code);
    assert_eq!(recs.len(), 2);
    assert_eq!((recs[0].start_pc, recs[0].end_pc), (0, reload));
    assert_eq!(recs[0].return_values, vec![StorePos::Local("y".to_string())]);
    assert_eq!(recs[1].return_values, vec![StorePos::Stack(0)]);

    // Different data, same shape: `y` must come from the cached graph
    let x = tensor(&[4], 2.1);
    let expected = data(&plain().run_code(&code, &[x.clone()]).unwrap());
    assert_eq!(data(&vm.run_code(&code, &[x]).unwrap()), expected);
    assert_eq!(ctx.stats().cache_hits, 2);
}
