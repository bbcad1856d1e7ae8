//! Host bytecode opcodes.
//!
//! A small stack-machine instruction set in the shape of CPython's, just wide
//! enough to run tensor model `forward` functions. Each instruction carries a
//! single `u32` argument (an index into the constant or name tables, a call
//! argument count, or an absolute jump target).
//!
//! Opcode ranges:
//! - 0x00-0x0F: Stack
//! - 0x10-0x1F: Loads and stores
//! - 0x20-0x2F: Calls
//! - 0x30-0x3F: Operators
//! - 0x50-0x5F: Control flow

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Stack (0x00-0x0F) ===
    /// No operation
    Nop = 0x00,
    /// Discard top of stack
    PopTop = 0x01,

    // === Loads and stores (0x10-0x1F) ===
    /// Push constant `consts[arg]`
    LoadConst = 0x10,
    /// Push local `varnames[arg]`
    LoadFast = 0x11,
    /// Pop into local `varnames[arg]`
    StoreFast = 0x12,
    /// Push global `names[arg]`
    LoadGlobal = 0x13,
    /// Replace TOS with `TOS.names[arg]`
    LoadAttr = 0x14,
    /// Replace TOS with a callable pair: `(method, self)` or `(NULL, attr)`
    LoadMethod = 0x15,

    // === Calls (0x20-0x2F) ===
    /// Call a callable below `arg` arguments
    CallFunction = 0x20,
    /// Call the pair pushed by `LoadMethod` with `arg` arguments
    CallMethod = 0x21,

    // === Operators (0x30-0x3F) ===
    BinaryAdd = 0x30,
    BinarySubtract = 0x31,
    BinaryMultiply = 0x32,
    BinaryTrueDivide = 0x33,
    /// `TOS1[TOS]`
    BinarySubscr = 0x34,
    UnaryNegative = 0x35,
    /// Build a slice from 2 or 3 stack values
    BuildSlice = 0x36,

    // === Control flow (0x50-0x5F) ===
    /// Jump to original pc `arg`
    JumpAbsolute = 0x50,
    /// Pop TOS; jump to `arg` if falsy
    PopJumpIfFalse = 0x51,
    /// Return TOS to the caller
    ReturnValue = 0x52,
}

impl Opcode {
    /// Convert byte to opcode, returns None if invalid
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE.get(byte as usize).copied().flatten()
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Get the mnemonic name for this opcode
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::PopTop => "POP_TOP",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadFast => "LOAD_FAST",
            Self::StoreFast => "STORE_FAST",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::LoadAttr => "LOAD_ATTR",
            Self::LoadMethod => "LOAD_METHOD",
            Self::CallFunction => "CALL_FUNCTION",
            Self::CallMethod => "CALL_METHOD",
            Self::BinaryAdd => "BINARY_ADD",
            Self::BinarySubtract => "BINARY_SUBTRACT",
            Self::BinaryMultiply => "BINARY_MULTIPLY",
            Self::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Self::BinarySubscr => "BINARY_SUBSCR",
            Self::UnaryNegative => "UNARY_NEGATIVE",
            Self::BuildSlice => "BUILD_SLICE",
            Self::JumpAbsolute => "JUMP_ABSOLUTE",
            Self::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Self::ReturnValue => "RETURN_VALUE",
        }
    }

    /// Whether the argument is meaningful for this opcode
    #[inline]
    pub fn has_arg(self) -> bool {
        !matches!(
            self,
            Self::Nop
                | Self::PopTop
                | Self::BinaryAdd
                | Self::BinarySubtract
                | Self::BinaryMultiply
                | Self::BinaryTrueDivide
                | Self::BinarySubscr
                | Self::UnaryNegative
                | Self::ReturnValue
        )
    }

    /// Check if this is a jump instruction
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self, Self::JumpAbsolute | Self::PopJumpIfFalse)
    }

    /// Check if this opcode can terminate execution
    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::ReturnValue)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Lookup table for byte -> Opcode conversion
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];

    // Stack
    table[0x00] = Some(Opcode::Nop);
    table[0x01] = Some(Opcode::PopTop);

    // Loads and stores
    table[0x10] = Some(Opcode::LoadConst);
    table[0x11] = Some(Opcode::LoadFast);
    table[0x12] = Some(Opcode::StoreFast);
    table[0x13] = Some(Opcode::LoadGlobal);
    table[0x14] = Some(Opcode::LoadAttr);
    table[0x15] = Some(Opcode::LoadMethod);

    // Calls
    table[0x20] = Some(Opcode::CallFunction);
    table[0x21] = Some(Opcode::CallMethod);

    // Operators
    table[0x30] = Some(Opcode::BinaryAdd);
    table[0x31] = Some(Opcode::BinarySubtract);
    table[0x32] = Some(Opcode::BinaryMultiply);
    table[0x33] = Some(Opcode::BinaryTrueDivide);
    table[0x34] = Some(Opcode::BinarySubscr);
    table[0x35] = Some(Opcode::UnaryNegative);
    table[0x36] = Some(Opcode::BuildSlice);

    // Control flow
    table[0x50] = Some(Opcode::JumpAbsolute);
    table[0x51] = Some(Opcode::PopJumpIfFalse);
    table[0x52] = Some(Opcode::ReturnValue);

    table
};
