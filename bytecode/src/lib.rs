//! The bytecode wire format: one-byte instructions with a high-nibble
//! opcode class and low-nibble immediate, an extended two-byte escape for
//! large immediates, and 16-bit little-endian absolute offsets for control
//! flow. [`InstructionStream`] decodes, [`BytecodeBuilder`] assembles.

mod builder;
mod decoder;
mod op;

pub use builder::{BytecodeBuilder, PatchSite};
pub use decoder::{Instruction, InstructionStream};
pub use op::{
    Opcode, Special, BINARY_ADD, BINARY_LESS, BINARY_LESS_EQUAL, CONST_FALSE,
    CONST_NIL, CONST_TRUE, UNARY_IS_NIL, UNARY_NOT_NIL,
};
