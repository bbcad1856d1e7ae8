//! Shared builders for integration tests
//!
//! - tracer/interpreter setup
//! - tensors with deterministic contents
//! - small host programs and models used across test files
#![allow(dead_code)]

use std::sync::Arc;

use graphtrace::host::{CodeBuilder, CodeObject, Interpreter, Module, Opcode, Tensor, Value};
use graphtrace::tracer::CachedGraph;
use graphtrace::{TracerConfig, TracerContext};

/// Context and an interpreter sharing it
pub fn traced_with(config: TracerConfig) -> (Arc<TracerContext>, Interpreter) {
    let ctx = TracerContext::shared(config);
    let vm = Interpreter::new(Arc::clone(&ctx));
    (ctx, vm)
}

pub fn traced() -> (Arc<TracerContext>, Interpreter) {
    traced_with(TracerConfig::default())
}

/// Interpreter with tracing off, the reference for cached results
pub fn plain() -> Interpreter {
    Interpreter::new(TracerContext::shared(TracerConfig::disabled()))
}

pub fn tensor(shape: &[usize], seed: f64) -> Value {
    let data = (0..shape.iter().product::<usize>())
        .map(|i| ((i as f64 + 1.0) * seed).sin())
        .collect();
    Value::tensor(Tensor::from_vec(shape, data).expect("valid tensor"))
}

pub fn data(value: &Value) -> Vec<f64> {
    value.as_tensor().expect("tensor result").data().to_vec()
}

pub fn records(ctx: &TracerContext, vm: &Interpreter, code: &Arc<CodeObject>) -> Vec<Arc<CachedGraph>> {
    let id = vm.frame_id_of(code).expect("code was prepared");
    ctx.frame_cache(id).records()
}

/// `f(a, b): return a + b`
pub fn add_fn() -> Arc<CodeObject> {
    let mut b = CodeBuilder::new("add").with_params(&["a", "b"]);
    b.load_fast("a");
    b.load_fast("b");
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    b.build_arc()
}

/// `f(x): return (x + 1.0) * 2.0`
pub fn affine_fn() -> Arc<CodeObject> {
    let mut b = CodeBuilder::new("affine").with_params(&["x"]);
    b.load_fast("x");
    b.load_const(Value::float(1.0));
    b.emit(Opcode::BinaryAdd);
    b.load_const(Value::float(2.0));
    b.emit(Opcode::BinaryMultiply);
    b.emit(Opcode::ReturnValue);
    b.build_arc()
}

/// Model with `forward(self, x): return self.act(self.fc(x))`
pub fn linear_model(in_features: usize, out_features: usize) -> Value {
    let mut b = CodeBuilder::new("Linear.forward").with_params(&["self", "x"]);
    b.load_fast("self");
    b.load_method("act");
    b.load_fast("self");
    b.load_method("fc");
    b.load_fast("x");
    b.call_method(1);
    b.call_method(1);
    b.emit(Opcode::ReturnValue);

    let weight = Tensor::from_vec(
        &[out_features, in_features],
        (0..out_features * in_features)
            .map(|i| (i as f64 * 0.7).cos())
            .collect(),
    )
    .expect("valid weight");
    let bias = Tensor::from_vec(&[out_features], vec![0.1; out_features]).expect("valid bias");

    Value::module(
        Module::container("Linear", b.build_arc())
            .with_child("fc", Value::module(Module::linear(weight, Some(bias))))
            .with_child("act", Value::module(Module::relu())),
    )
}

pub fn forward_code(model: &Value) -> Arc<CodeObject> {
    Arc::clone(
        model
            .as_module()
            .and_then(|m| m.forward())
            .expect("model with forward"),
    )
}
