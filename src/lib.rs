/// graphtrace - Guard-Based Tracing JIT Front End
///
/// This library watches a bytecode interpreter execute tensor model code,
/// extracts straight-line runs of tensor operations into graphs, and replays
/// them from a cache when the same code is reached with compatible inputs.
///
/// # Architecture
///
/// 1. **Host runtime** (`host` module)
///    - Stack-machine bytecode in the shape of CPython's
///    - Values, tensors, modules with a `forward` code object
///    - Interpreter that consults the tracer before every instruction
///
/// 2. **Tracer** (`tracer` module)
///    - `GuardTracker`: per-frame state machine over instructions
///    - `ObjectTable`: identity-keyed map from runtime values to variables
///    - Variables emit guards, graph operands and output extractors
///    - `CachedGraph`: guard + compiled graph + write-back plan
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use graphtrace::host::{CodeBuilder, Interpreter, Opcode, Tensor, Value};
/// use graphtrace::{TracerConfig, TracerContext};
///
/// // def f(x): return x * 2.0
/// let mut b = CodeBuilder::new("f").with_params(&["x"]);
/// b.load_fast("x");
/// b.load_const(Value::float(2.0));
/// b.emit(Opcode::BinaryMultiply);
/// b.emit(Opcode::ReturnValue);
/// let code = b.build_arc();
///
/// let ctx = Arc::new(TracerContext::new(TracerConfig::default()));
/// let mut vm = Interpreter::new(Arc::clone(&ctx));
/// let x = Value::tensor(Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap());
///
/// vm.run_code(&code, &[x.clone()]).unwrap();   // traced, record committed
/// let y = vm.run_code(&code, &[x]).unwrap();   // replayed from the cache
///
/// assert_eq!(y.as_tensor().unwrap().data(), &[2.0, 4.0]);
/// assert_eq!(ctx.stats().cache_hits, 1);
/// ```
///
/// # Soundness
///
/// - A guard is the conjunction of one or more clauses per guarded variable
/// - Guards never read values the trace did not read
/// - Anything the tracer does not understand restarts the trace; the
///   interpreter always remains correct without the cache

pub mod config;
pub mod host;
pub mod tracer;

pub use config::{ConfigError, TracerConfig};
pub use host::{Interpreter, Value};
pub use tracer::{
    CachedGraph, FatalError, GuardTracker, ObjectTable, TraceError, TraceStats, TracerContext,
    Variable,
};
