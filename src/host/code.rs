//! Code objects and their instrumented instruction streams.
//!
//! A [`CodeObject`] is what a compiler front end would produce: a flat list
//! of [`Instruction`]s plus constant and name tables. Jump arguments are
//! *original* pcs, i.e. indices into that list.
//!
//! Before running, the interpreter wraps each code object in a
//! [`ProcessedCode`], the raw stream actually executed. The raw stream may
//! contain injected instructions that have no original pc:
//!
//! ```text
//!   raw index:  0     1        2     3
//!   raw:        [o0]  [inject] [o1]  [o2]
//!   original:   0     -        1     2
//! ```
//!
//! The tracer only ever reasons about original pcs and uses
//! [`InstructionMap`] to translate.

use std::fmt;
use std::sync::Arc;

use crate::tracer::access::InstructionMap;

use super::opcodes::Opcode;
use super::value::Value;

/// Identity of a processed code object; keys the frame cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u32,
}

impl Instruction {
    pub const fn new(opcode: Opcode, arg: u32) -> Self {
        Self { opcode, arg }
    }

    pub const fn simple(opcode: Opcode) -> Self {
        Self { opcode, arg: 0 }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.opcode.has_arg() {
            write!(f, "{} {}", self.opcode, self.arg)
        } else {
            write!(f, "{}", self.opcode)
        }
    }
}

// ============================================================================
// CodeObject
// ============================================================================

#[derive(Debug)]
pub struct CodeObject {
    name: String,
    params: Vec<String>,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    /// Local variable names (`LOAD_FAST`/`STORE_FAST`)
    varnames: Vec<String>,
    /// Global and attribute names
    names: Vec<String>,
}

impl CodeObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter names, bound in order on call.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction(&self, pc: usize) -> Option<Instruction> {
        self.instructions.get(pc).copied()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn constant(&self, index: u32) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn varname(&self, index: u32) -> Option<&str> {
        self.varnames.get(index as usize).map(String::as_str)
    }

    pub fn name_at(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    /// Render one instruction with its resolved argument.
    pub fn disassemble_instruction(&self, pc: usize) -> String {
        let Some(inst) = self.instruction(pc) else {
            return format!("{:4} ???", pc);
        };
        let arg = match inst.opcode {
            Opcode::LoadConst => self
                .constant(inst.arg)
                .map_or_else(|| "???".to_string(), |c| format!("{} ({})", inst.arg, c)),
            Opcode::LoadFast | Opcode::StoreFast => {
                format!("{} ({})", inst.arg, self.varname(inst.arg).unwrap_or("???"))
            }
            Opcode::LoadGlobal | Opcode::LoadAttr | Opcode::LoadMethod => {
                format!("{} ({})", inst.arg, self.name_at(inst.arg).unwrap_or("???"))
            }
            Opcode::JumpAbsolute | Opcode::PopJumpIfFalse => format!("to {}", inst.arg),
            op if op.has_arg() => inst.arg.to_string(),
            _ => String::new(),
        };
        format!("{:4} {:<20} {}", pc, inst.opcode.mnemonic(), arg)
            .trim_end()
            .to_string()
    }

    /// Disassemble the whole code object
    pub fn disassemble(&self) -> String {
        let mut output = format!("=== {} ===\n", self.name);
        for pc in 0..self.instructions.len() {
            output.push_str(&self.disassemble_instruction(pc));
            output.push('\n');
        }
        output
    }
}

// ============================================================================
// CodeBuilder
// ============================================================================

/// Builder for code objects
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    params: Vec<String>,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    varnames: Vec<String>,
    names: Vec<String>,
}

/// Label for a forward jump to be patched later
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel {
    pc: usize,
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            instructions: Vec::new(),
            constants: Vec::new(),
            varnames: Vec::new(),
            names: Vec::new(),
        }
    }

    /// Declare parameters; they occupy the first local slots.
    pub fn with_params(mut self, params: &[&str]) -> Self {
        for p in params {
            self.params.push((*p).to_string());
            self.add_varname(p);
        }
        self
    }

    /// Pc the next emitted instruction will get
    #[inline]
    pub fn current_pc(&self) -> usize {
        self.instructions.len()
    }

    /// Emit an instruction without argument, returns its pc
    pub fn emit(&mut self, opcode: Opcode) -> usize {
        self.emit_arg(opcode, 0)
    }

    /// Emit an instruction with argument, returns its pc
    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32) -> usize {
        let pc = self.instructions.len();
        self.instructions.push(Instruction::new(opcode, arg));
        pc
    }

    /// Add a constant to the pool, returns its index.
    /// Constants are deduplicated by identity, not by value.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| c.is(&value)) {
            return i as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn add_varname(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    pub fn add_name(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    pub fn load_const(&mut self, value: Value) -> usize {
        let index = self.add_constant(value);
        self.emit_arg(Opcode::LoadConst, index)
    }

    pub fn load_fast(&mut self, name: &str) -> usize {
        let index = self.add_varname(name);
        self.emit_arg(Opcode::LoadFast, index)
    }

    pub fn store_fast(&mut self, name: &str) -> usize {
        let index = self.add_varname(name);
        self.emit_arg(Opcode::StoreFast, index)
    }

    pub fn load_global(&mut self, name: &str) -> usize {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadGlobal, index)
    }

    pub fn load_attr(&mut self, name: &str) -> usize {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadAttr, index)
    }

    pub fn load_method(&mut self, name: &str) -> usize {
        let index = self.add_name(name);
        self.emit_arg(Opcode::LoadMethod, index)
    }

    pub fn call_method(&mut self, argc: u32) -> usize {
        self.emit_arg(Opcode::CallMethod, argc)
    }

    pub fn call_function(&mut self, argc: u32) -> usize {
        self.emit_arg(Opcode::CallFunction, argc)
    }

    /// Create a forward jump, returns a label to patch later
    pub fn emit_jump(&mut self, opcode: Opcode) -> JumpLabel {
        debug_assert!(opcode.is_jump());
        let pc = self.emit_arg(opcode, u32::MAX);
        JumpLabel { pc }
    }

    /// Patch a jump label to jump to the current position
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.instructions.len() as u32;
        if let Some(inst) = self.instructions.get_mut(label.pc) {
            inst.arg = target;
        }
    }

    /// Emit a jump to a known target
    pub fn emit_jump_to(&mut self, opcode: Opcode, target: usize) -> usize {
        debug_assert!(opcode.is_jump());
        self.emit_arg(opcode, target as u32)
    }

    pub fn build(self) -> CodeObject {
        CodeObject {
            name: self.name,
            params: self.params,
            instructions: self.instructions,
            constants: self.constants,
            varnames: self.varnames,
            names: self.names,
        }
    }

    pub fn build_arc(self) -> Arc<CodeObject> {
        Arc::new(self.build())
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u32 {
    if let Some(i) = table.iter().position(|n| n == name) {
        return i as u32;
    }
    table.push(name.to_string());
    (table.len() - 1) as u32
}

// ============================================================================
// ProcessedCode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawInstruction {
    Original(usize),
    Injected(Instruction),
}

/// The raw instruction stream the interpreter executes for one code object.
#[derive(Debug)]
pub struct ProcessedCode {
    id: FrameId,
    code: Arc<CodeObject>,
    raw: Vec<RawInstruction>,
    /// Original pc -> raw index
    orig_to_raw: Vec<usize>,
}

impl ProcessedCode {
    /// Raw stream identical to the original instructions.
    pub fn new(id: FrameId, code: Arc<CodeObject>) -> Self {
        Self::with_injected(id, code, &[])
    }

    /// Raw stream with extra instructions inserted. Each `(pc, inst)` places
    /// `inst` immediately before original instruction `pc`; `pc == len`
    /// appends at the end.
    pub fn with_injected(id: FrameId, code: Arc<CodeObject>, injected: &[(usize, Instruction)]) -> Self {
        let mut raw = Vec::with_capacity(code.len() + injected.len());
        let mut orig_to_raw = Vec::with_capacity(code.len());
        for pc in 0..=code.len() {
            raw.extend(
                injected
                    .iter()
                    .filter(|(at, _)| *at == pc)
                    .map(|(_, inst)| RawInstruction::Injected(*inst)),
            );
            if pc < code.len() {
                orig_to_raw.push(raw.len());
                raw.push(RawInstruction::Original(pc));
            }
        }
        Self {
            id,
            code,
            raw,
            orig_to_raw,
        }
    }

    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    #[inline]
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Instruction at raw index, injected or not
    pub fn raw_instruction(&self, raw: usize) -> Option<Instruction> {
        match self.raw.get(raw)? {
            RawInstruction::Original(pc) => self.code.instruction(*pc),
            RawInstruction::Injected(inst) => Some(*inst),
        }
    }

    /// Original pc and instruction at a raw index, `None` for injected code
    pub fn get_orig_inst(&self, raw: usize) -> Option<(usize, Instruction)> {
        let pc = self.translate_to_original_pc(raw)?;
        Some((pc, self.code.instruction(pc)?))
    }

    /// Raw index of an original pc; `pc == len` maps past the end.
    pub fn raw_index_of(&self, pc: usize) -> Option<usize> {
        if pc == self.code.len() {
            return Some(self.raw.len());
        }
        self.orig_to_raw.get(pc).copied()
    }
}

impl InstructionMap for ProcessedCode {
    fn translate_to_original_pc(&self, raw: usize) -> Option<usize> {
        match self.raw.get(raw)? {
            RawInstruction::Original(pc) => Some(*pc),
            RawInstruction::Injected(_) => None,
        }
    }

    fn next_original_pc(&self, raw: usize) -> usize {
        self.raw
            .iter()
            .skip(raw)
            .find_map(|r| match r {
                RawInstruction::Original(pc) => Some(*pc),
                RawInstruction::Injected(_) => None,
            })
            .unwrap_or(self.code.len())
    }
}
