//! How the tracer sees a running frame.
//!
//! The tracer never owns interpreter state. It reads through [`FrameAccess`]
//! and names what it read with an [`AccessPath`], so a guard or a graph input
//! can re-read the same slot from a later frame.

use std::fmt;

use crate::host::frame::FrameHandle;
use crate::host::value::Value;

/// Read-only view of a frame's operand stack, locals and globals.
pub trait FrameAccess {
    /// Value `depth` slots below the top of stack (0 is TOS).
    fn peek(&self, depth: usize) -> Option<Value>;
    fn stack_depth(&self) -> usize;
    fn local(&self, name: &str) -> Option<Value>;
    fn global(&self, name: &str) -> Option<Value>;
}

/// A frame the tracker can follow step by step.
pub trait TracedFrame: FrameAccess {
    fn handle(&self) -> FrameHandle;
    /// Raw instruction pointer of the instruction about to execute.
    fn last_instruction(&self) -> usize;
}

/// Translation between the raw (instrumented) stream and original pcs.
pub trait InstructionMap {
    /// `None` when `raw` points at injected code.
    fn translate_to_original_pc(&self, raw: usize) -> Option<usize>;
    /// First original pc at or after `raw`; the code length past the end.
    fn next_original_pc(&self, raw: usize) -> usize;
}

/// Where a value was read from at trace start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessPath {
    Local(String),
    /// Stack slot counted from the top
    Stack(usize),
    Global(String),
    Attr(Box<AccessPath>, String),
}

impl AccessPath {
    pub fn local(name: impl Into<String>) -> Self {
        Self::Local(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::Global(name.into())
    }

    /// `self.name`
    pub fn attr(&self, name: impl Into<String>) -> Self {
        Self::Attr(Box::new(self.clone()), name.into())
    }

    /// Re-read the value this path denotes.
    pub fn resolve(&self, frame: &dyn FrameAccess) -> Option<Value> {
        match self {
            Self::Local(name) => frame.local(name),
            Self::Stack(depth) => frame.peek(*depth),
            Self::Global(name) => frame.global(name),
            Self::Attr(base, name) => base.resolve(frame)?.get_attr(name),
        }
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => write!(f, "locals[\"{}\"]", name),
            Self::Stack(depth) => write!(f, "locals['__stack__{}']", depth),
            Self::Global(name) => write!(f, "globals[\"{}\"]", name),
            Self::Attr(base, name) => write!(f, "({}).{}", base, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(AccessPath::local("x").to_string(), "locals[\"x\"]");
        assert_eq!(AccessPath::Stack(2).to_string(), "locals['__stack__2']");
        assert_eq!(AccessPath::global("f").to_string(), "globals[\"f\"]");
        assert_eq!(
            AccessPath::local("self").attr("fc").to_string(),
            "(locals[\"self\"]).fc"
        );
    }
}
