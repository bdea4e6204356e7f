//! Error types for loading and running programs

use sieve_bytecode::BytecodeError;
use sieve_jit::{BlindError, RegionError};
use thiserror::Error;

/// Classic program rejected by the structural check or the converter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrateError {
    /// No instructions
    #[error("empty classic program")]
    Empty,

    /// More instructions than a classic program may hold
    #[error("classic program has {0} instructions, limit is 4096")]
    TooLong(usize),

    /// Opcode outside the classic instruction set
    #[error("unknown classic opcode {code:#06x} at {pc}")]
    UnknownOpcode {
        /// Instruction index
        pc: usize,
        /// Offending opcode
        code: u16,
    },

    /// Ancillary offset that names no known metadata
    #[error("unknown ancillary load {k:#x} at {pc}")]
    UnknownAncillary {
        /// Instruction index
        pc: usize,
        /// Offending offset
        k: u32,
    },

    /// Jump leaves the program
    #[error("jump at {pc} leaves the program")]
    JumpOutOfRange {
        /// Instruction index
        pc: usize,
    },

    /// Division or modulo by constant zero
    #[error("division by zero at {pc}")]
    DivisionByZero {
        /// Instruction index
        pc: usize,
    },

    /// Constant shift of 32 or more
    #[error("shift by {k} at {pc}")]
    ShiftTooLarge {
        /// Instruction index
        pc: usize,
        /// Shift amount
        k: u32,
    },

    /// Scratch slot index outside `0..16`
    #[error("scratch slot {k} at {pc} is out of range")]
    ScratchOutOfRange {
        /// Instruction index
        pc: usize,
        /// Slot index
        k: u32,
    },

    /// Scratch slot read before any path stored to it
    #[error("scratch slot {k} read at {pc} before it is written")]
    UninitializedScratch {
        /// Instruction index
        pc: usize,
        /// Slot index
        k: u32,
    },

    /// Last instruction is not a return
    #[error("classic program does not end with a return")]
    MissingReturn,

    /// Converted jump no longer fits its displacement
    #[error("converted jump at {pc} is out of range")]
    OffsetOverflow {
        /// Classic instruction index
        pc: usize,
    },
}

/// The code generator refused a program
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Declined {
    /// Opcode the generator cannot lower
    #[error("unsupported opcode {code:#04x} at {pc}")]
    Unsupported {
        /// Instruction index
        pc: usize,
        /// Offending opcode
        code: u8,
    },

    /// Branch or call target outside the program
    #[error("branch at {pc} targets outside the program")]
    BadTarget {
        /// Instruction index
        pc: usize,
    },

    /// The image did not fit the reserved space
    #[error("image needs {need} bytes, {have} reserved")]
    ImageTooSmall {
        /// Bytes needed
        need: usize,
        /// Bytes reserved
        have: usize,
    },

    /// Offset table is empty, longer than the program, out of order or
    /// points past the image
    #[error("malformed instruction offset table")]
    BadOffsets,
}

/// Compilation failed; recoverable unless compiled execution is mandatory
#[derive(Debug, Error)]
pub enum CompileError {
    /// Constant blinding failed
    #[error(transparent)]
    Blind(#[from] BlindError),

    /// Code memory could not be obtained or protected
    #[error(transparent)]
    Region(#[from] RegionError),

    /// The generator declined the program
    #[error("code generator declined: {0}")]
    Declined(#[from] Declined),
}

/// Program load failed
#[derive(Debug, Error)]
pub enum LoadError {
    /// Program has no instructions
    #[error("empty program")]
    Empty,

    /// Encoded instructions could not be decoded
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    /// Classic program could not be migrated
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// Program name is too long or has characters outside `[A-Za-z0-9_.]`
    #[error("invalid program name {0:?}")]
    InvalidName(String),

    /// Compiled execution is mandatory but no code generator may run
    #[error("compiled execution is required but the jit is unavailable")]
    JitRequired,

    /// Compiled execution is mandatory and compilation failed
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
}

/// Result type for load operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Runtime fault; ends the invocation with result 0
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Access outside every mapped area
    #[error("out-of-bounds access of {len} bytes at {addr:#x} (pc {pc}, write: {write})")]
    MemoryAccess {
        /// Instruction index
        pc: usize,
        /// Virtual address
        addr: u64,
        /// Access width
        len: usize,
        /// Whether the access was a store
        write: bool,
    },

    /// Helper id with no registered function
    #[error("unknown helper {id} at {pc}")]
    UnknownHelper {
        /// Instruction index
        pc: usize,
        /// Helper id
        id: i32,
    },

    /// Too many nested calls
    #[error("call depth exceeded at {pc}")]
    CallDepth {
        /// Instruction index
        pc: usize,
    },

    /// Opcode with no defined behaviour
    #[error("invalid opcode {code:#04x} at {pc}")]
    InvalidOpcode {
        /// Instruction index
        pc: usize,
        /// Offending opcode
        code: u8,
    },

    /// Control left the program
    #[error("pc {pc} outside the program")]
    PcOutOfRange {
        /// Offending pc
        pc: i64,
    },

    /// Poison in compiled code was executed
    #[error("trap in compiled code at slot {slot}")]
    Trap {
        /// Slot index
        slot: usize,
    },
}
