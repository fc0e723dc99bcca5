/// Bytecode opcode classes, carried in the high nibble of each instruction
/// byte. The low nibble holds the immediate; [`Opcode::Extended`] promotes
/// immediates above 15 (the low nibble becomes the class, the next byte the
/// immediate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Extended = 0,
    PushInstance = 1,
    PushArgument = 2,
    PushTemporary = 3,
    PushLiteral = 4,
    PushConstant = 5,
    AssignInstance = 6,
    AssignTemporary = 7,
    MarkArguments = 8,
    SendMessage = 9,
    SendUnary = 10,
    SendBinary = 11,
    PushBlock = 12,
    DoPrimitive = 13,
    DoSpecial = 14,
}

impl Opcode {
    pub const COUNT: usize = Opcode::DoSpecial as usize + 1;
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Opcode is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Sub-opcodes of [`Opcode::DoSpecial`], carried in the immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Special {
    /// Return the activation's `self`.
    SelfReturn = 1,
    /// Return top-of-stack.
    StackReturn = 2,
    /// Non-local return: unwind to the block's creating context.
    BlockReturn = 3,
    Duplicate = 4,
    PopTop = 5,
    /// Unconditional jump; 16-bit absolute offset follows.
    Branch = 6,
    /// Pop; jump iff the value is the true singleton.
    BranchIfTrue = 7,
    /// Pop; jump iff the value is the false singleton.
    BranchIfFalse = 8,
    /// Like sendMessage, but lookup starts at the method class's superclass.
    /// The selector literal index follows in the next byte.
    SendToSuper = 11,
    /// Halt interpretation with the break result.
    Breakpoint = 12,
}

impl TryFrom<u8> for Special {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            1 => Special::SelfReturn,
            2 => Special::StackReturn,
            3 => Special::BlockReturn,
            4 => Special::Duplicate,
            5 => Special::PopTop,
            6 => Special::Branch,
            7 => Special::BranchIfTrue,
            8 => Special::BranchIfFalse,
            11 => Special::SendToSuper,
            12 => Special::Breakpoint,
            other => return Err(other),
        })
    }
}

/// [`Opcode::PushConstant`] immediates above the inline integers 0–9.
pub const CONST_NIL: u8 = 10;
pub const CONST_TRUE: u8 = 11;
pub const CONST_FALSE: u8 = 12;

/// [`Opcode::SendUnary`] immediates.
pub const UNARY_IS_NIL: u8 = 0;
pub const UNARY_NOT_NIL: u8 = 1;

/// [`Opcode::SendBinary`] immediates. The numbering matches the image's
/// `binaryMessages` root table: `<`, `<=`, `+`.
pub const BINARY_LESS: u8 = 0;
pub const BINARY_LESS_EQUAL: u8 = 1;
pub const BINARY_ADD: u8 = 2;
