//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while decoding instruction streams
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    /// Input length is not a multiple of the instruction size
    #[error("truncated instruction stream: {len} bytes is not a multiple of {slot}")]
    Truncated {
        /// Length of the input in bytes
        len: usize,
        /// Size of one instruction slot
        slot: usize,
    },

    /// Program has no instructions
    #[error("empty program")]
    Empty,

    /// A 64-bit immediate load is missing its second slot
    #[error("wide immediate at {0} has no second slot")]
    MissingWideHalf(usize),

    /// Unknown register index in an encoded slot
    #[error("invalid register {reg} at instruction {pc}")]
    InvalidRegister {
        /// Instruction index
        pc: usize,
        /// Offending register number
        reg: u8,
    },
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
