//! Activation record of one host call.
//!
//! Layout:
//! - `locals`: name -> value, parameters bound at entry
//! - `stack`: value stack, top at the end of the vector
//! - `ip`: *raw* index into the processed instruction stream
//!
//! The frame is what guards and graph-input extractors read through
//! [`FrameAccess`]; stack depths there count from the top, so depth 0 is the
//! last pushed value.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::tracer::access::{FrameAccess, TracedFrame};
use crate::tracer::cache::StorePos;

use super::code::ProcessedCode;
use super::types::{VmError, VmResult};
use super::value::Value;

/// Identity of one live frame, distinct from the code object's [`FrameId`].
///
/// [`FrameId`]: super::code::FrameId
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(u64);

impl FrameHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Frame {
    handle: FrameHandle,
    code: Arc<ProcessedCode>,
    locals: HashMap<String, Value>,
    stack: Vec<Value>,
    ip: usize,
    globals: Arc<HashMap<String, Value>>,
}

impl Frame {
    pub fn new(handle: FrameHandle, code: Arc<ProcessedCode>, globals: Arc<HashMap<String, Value>>) -> Self {
        Self {
            handle,
            code,
            locals: HashMap::new(),
            stack: Vec::with_capacity(16),
            ip: 0,
            globals,
        }
    }

    #[inline]
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    #[inline]
    pub fn code(&self) -> &Arc<ProcessedCode> {
        &self.code
    }

    pub fn globals(&self) -> &HashMap<String, Value> {
        &self.globals
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn get_local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    // === Stack ===

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pop `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if n > self.stack.len() {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    #[inline]
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    // === Instruction pointer ===

    #[inline]
    pub fn ip(&self) -> usize {
        self.ip
    }

    #[inline]
    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    #[inline]
    pub fn advance(&mut self) {
        self.ip += 1;
    }

    /// Continue at original pc `pc`.
    pub fn jump_to(&mut self, pc: usize) -> VmResult<()> {
        self.ip = self.code.raw_index_of(pc).ok_or(VmError::IpOutOfBounds)?;
        Ok(())
    }

    /// Write the results of a cached graph back into the frame.
    ///
    /// The stack is resized to `end_depth`; `Stack(i)` lands `i` slots below
    /// the new top and `Local(name)` rebinds the local.
    pub fn apply_outputs(&mut self, plan: &[StorePos], values: Vec<Value>, end_depth: usize) -> VmResult<()> {
        if plan.len() != values.len() {
            return Err(VmError::Runtime(format!(
                "cached graph produced {} values for {} slots",
                values.len(),
                plan.len()
            )));
        }
        self.stack.resize_with(end_depth, Value::none);
        for (pos, value) in plan.iter().zip(values) {
            match pos {
                StorePos::Stack(depth) => {
                    let index = end_depth
                        .checked_sub(depth + 1)
                        .ok_or(VmError::StackUnderflow)?;
                    self.stack[index] = value;
                }
                StorePos::Local(name) => {
                    self.locals.insert(name.clone(), value);
                }
            }
        }
        Ok(())
    }
}

impl FrameAccess for Frame {
    fn peek(&self, depth: usize) -> Option<Value> {
        let index = self.stack.len().checked_sub(depth + 1)?;
        self.stack.get(index).cloned()
    }

    fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn local(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }
}

impl TracedFrame for Frame {
    fn handle(&self) -> FrameHandle {
        self.handle
    }

    fn last_instruction(&self) -> usize {
        self.ip
    }
}
