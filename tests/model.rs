//! Module calls, nested frames and backend failures.

mod common;

use std::sync::Arc;

use common::*;
use graphtrace::host::{CodeBuilder, Interpreter, Opcode, Value};
use graphtrace::tracer::{CompileError, CompiledArtifact, Graph, GraphCompiler, GraphError, NodeId};
use graphtrace::{TracerConfig, TracerContext};

#[test]
fn test_linear_model_hits_and_matches_interpretation() {
    let model = linear_model(4, 3);
    let x = tensor(&[2, 4], 0.6);
    let expected = data(&plain().call(&model, &[x.clone()]).unwrap());

    let (ctx, mut vm) = traced();
    let first = vm.call(&model, &[x.clone()]).unwrap();
    let second = vm.call(&model, &[x]).unwrap();

    assert_eq!(data(&first), expected);
    assert_eq!(data(&second), expected);
    assert_eq!(ctx.stats().cache_hits, 1);
    assert!(vm.trackers().is_empty());

    let recs = records(&ctx, &vm, &forward_code(&model));
    assert_eq!(recs.len(), 1);
    assert_eq!((recs[0].start_pc, recs[0].end_pc), (0, 7));
}

#[test]
fn test_other_model_instance_does_not_reuse_record() {
    let model = linear_model(4, 3);
    let other = linear_model(4, 3);
    let x = tensor(&[1, 4], 0.2);

    let (ctx, mut vm) = traced();
    vm.call(&model, &[x.clone()]).unwrap();
    let y = vm.call(&other, &[x.clone()]).unwrap();

    assert_eq!(ctx.stats().cache_hits, 0);
    assert_eq!(data(&y), data(&plain().call(&other, &[x]).unwrap()));
}

#[test]
fn test_nested_function_calls_trace_each_frame() {
    // inner(y): return y * 2.0
    let mut b = CodeBuilder::new("inner").with_params(&["y"]);
    b.load_fast("y");
    b.load_const(Value::float(2.0));
    b.emit(Opcode::BinaryMultiply);
    b.emit(Opcode::ReturnValue);
    let inner = b.build_arc();

    // outer(x): return inner(x) + 1.0
    let mut b = CodeBuilder::new("outer").with_params(&["x"]);
    b.load_global("inner");
    b.load_fast("x");
    b.call_function(1);
    b.load_const(Value::float(1.0));
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let outer = b.build_arc();

    let setup = |vm: &mut Interpreter| vm.set_global("inner", Value::function(Arc::clone(&inner)));
    let x = tensor(&[3], 0.8);

    let mut reference = plain();
    setup(&mut reference);
    let expected = data(&reference.run_code(&outer, &[x.clone()]).unwrap());

    let (ctx, mut vm) = traced();
    setup(&mut vm);
    assert_eq!(data(&vm.run_code(&outer, &[x.clone()]).unwrap()), expected);
    assert!(vm.trackers().is_empty());
    assert!(!records(&ctx, &vm, &outer).is_empty());
    assert_eq!(records(&ctx, &vm, &inner).len(), 1);

    assert_eq!(data(&vm.run_code(&outer, &[x]).unwrap()), expected);
    assert!(ctx.stats().cache_hits >= 2);
    assert!(vm.trackers().is_empty());
}

struct RefusingCompiler;

impl GraphCompiler for RefusingCompiler {
    fn name(&self) -> &'static str {
        "refusing"
    }

    fn compile(&self, _graph: &Graph, _outputs: &[NodeId]) -> Result<Arc<dyn CompiledArtifact>, CompileError> {
        Err(CompileError::Backend("no codegen for this target".to_string()))
    }
}

struct BrokenArtifact;

impl CompiledArtifact for BrokenArtifact {
    fn run(&self, _inputs: &[Value]) -> Result<Vec<Value>, GraphError> {
        Err(GraphError::MissingOutput(0))
    }
}

struct BrokenCompiler;

impl GraphCompiler for BrokenCompiler {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn compile(&self, _graph: &Graph, _outputs: &[NodeId]) -> Result<Arc<dyn CompiledArtifact>, CompileError> {
        Ok(Arc::new(BrokenArtifact))
    }
}

#[test]
fn test_compile_failure_abandons_trace() {
    let ctx = Arc::new(TracerContext::with_compiler(
        TracerConfig::default(),
        Arc::new(RefusingCompiler),
    ));
    let mut vm = Interpreter::new(Arc::clone(&ctx));
    let code = affine_fn();
    let x = tensor(&[2], 0.3);

    let y = vm.run_code(&code, &[x.clone()]).unwrap();
    assert_eq!(data(&y), data(&plain().run_code(&code, &[x]).unwrap()));
    assert!(records(&ctx, &vm, &code).is_empty());
    assert_eq!(ctx.stats().abandoned, 1);
    assert_eq!(ctx.stats().commits, 0);
}

#[test]
fn test_failing_artifact_falls_back_to_interpreter() {
    let ctx = Arc::new(TracerContext::with_compiler(
        TracerConfig::default(),
        Arc::new(BrokenCompiler),
    ));
    let mut vm = Interpreter::new(Arc::clone(&ctx));
    let code = affine_fn();
    let x = tensor(&[2, 2], 0.3);
    let expected = data(&plain().run_code(&code, &[x.clone()]).unwrap());

    assert_eq!(data(&vm.run_code(&code, &[x.clone()]).unwrap()), expected);
    assert_eq!(data(&vm.run_code(&code, &[x]).unwrap()), expected);
    assert_eq!(ctx.stats().cache_hits, 0);
    assert!(vm.trackers().is_empty());
}
