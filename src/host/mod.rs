//! Host runtime: the bytecode interpreter whose frames the tracer watches.
//!
//! - value/tensor: the object model and the tensor kernel
//! - code/opcodes: code objects, instruction set, processed raw streams
//! - frame/vm: activation records and the interpreter loop
//! - ops: builtin and leaf-module kernels shared with the graph backend
//! - analysis: live-variable analysis over code objects

pub mod analysis;
pub mod code;
pub mod frame;
pub mod opcodes;
pub mod ops;
pub mod tensor;
pub mod types;
pub mod value;
pub mod vm;

pub use code::{CodeBuilder, CodeObject, FrameId, Instruction, ProcessedCode};
pub use frame::{Frame, FrameHandle};
pub use opcodes::Opcode;
pub use tensor::{DType, Tensor, TensorError};
pub use types::{VmConfig, VmError, VmResult};
pub use value::{Builtin, Module, ModuleKind, Object, SliceValue, Value};
pub use vm::Interpreter;
