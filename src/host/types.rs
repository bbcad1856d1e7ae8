//! Type definitions for the host VM.
//!
//! - VmError: errors raised while interpreting host bytecode
//! - VmConfig: interpreter limits and step tracing

use crate::tracer::error::FatalError;

use super::tensor::TensorError;

/// Result of VM execution
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can occur during VM execution
#[derive(Debug, Clone)]
pub enum VmError {
    /// Stack underflow
    StackUnderflow,
    /// Instruction pointer out of bounds
    IpOutOfBounds,
    /// Invalid constant index
    InvalidConstant(u32),
    /// Invalid local or global name index
    InvalidName(u32),
    /// Local read before assignment
    UnboundLocal(String),
    /// Global not defined
    UnknownGlobal(String),
    /// Attribute lookup failed
    AttributeError { type_name: &'static str, name: String },
    /// Type error in operation
    TypeError { expected: &'static str, got: &'static str },
    /// Wrong number of arguments
    ArityMismatch { expected: usize, got: usize },
    /// Value is not callable
    NotCallable(&'static str),
    /// Division by zero
    DivisionByZero,
    /// Integer arithmetic overflow
    ArithmeticOverflow,
    /// Index out of bounds
    IndexOutOfBounds { index: i64, len: usize },
    /// Tensor kernel failure
    Tensor(TensorError),
    /// Call stack overflow
    CallStackOverflow,
    /// Value stack overflow
    ValueStackOverflow,
    /// Tracer consistency violation; interpretation cannot continue
    Fatal(FatalError),
    /// Runtime error with message
    Runtime(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "Stack underflow"),
            Self::IpOutOfBounds => write!(f, "Instruction pointer out of bounds"),
            Self::InvalidConstant(i) => write!(f, "Invalid constant index: {}", i),
            Self::InvalidName(i) => write!(f, "Invalid name index: {}", i),
            Self::UnboundLocal(name) => {
                write!(f, "Local variable '{}' referenced before assignment", name)
            }
            Self::UnknownGlobal(name) => write!(f, "Name '{}' is not defined", name),
            Self::AttributeError { type_name, name } => {
                write!(f, "'{}' object has no attribute '{}'", type_name, name)
            }
            Self::TypeError { expected, got } => {
                write!(f, "Type error: expected {}, got {}", expected, got)
            }
            Self::ArityMismatch { expected, got } => {
                write!(f, "Expected {} arguments, got {}", expected, got)
            }
            Self::NotCallable(type_name) => write!(f, "'{}' object is not callable", type_name),
            Self::DivisionByZero => write!(f, "Division by zero"),
            Self::ArithmeticOverflow => write!(f, "Arithmetic overflow"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "Index out of bounds: index {} but length is {}", index, len)
            }
            Self::Tensor(e) => write!(f, "Tensor error: {}", e),
            Self::CallStackOverflow => write!(f, "Call stack overflow"),
            Self::ValueStackOverflow => write!(f, "Value stack overflow"),
            Self::Fatal(e) => write!(f, "Fatal tracer error: {}", e),
            Self::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tensor(e) => Some(e),
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorError> for VmError {
    fn from(e: TensorError) -> Self {
        Self::Tensor(e)
    }
}

impl From<FatalError> for VmError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

/// VM configuration
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum value stack size per frame
    pub max_value_stack: usize,
    /// Maximum nesting of host calls
    pub max_call_depth: usize,
    /// Log every executed instruction
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_value_stack: 1_024,
            max_call_depth: 256,
            trace: false,
        }
    }
}

impl VmConfig {
    /// Enable per-instruction tracing
    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }
}
