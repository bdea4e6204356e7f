//! # Sieve Bytecode
//!
//! Instruction format for the sieve packet-filter engine.
//!
//! ## Design Principles
//!
//! - **Fixed width**: every instruction slot is 8 bytes; 64-bit immediates take two slots
//! - **Register-based**: ten general registers, a read-only frame pointer and a hidden
//!   auxiliary register reserved for the JIT
//! - **Two generations**: the current instruction set plus the classic socket-filter
//!   format that gets migrated onto it

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod classic;
pub mod error;
pub mod helper_id;
pub mod insn;
pub mod opcode;
pub mod prog_type;
pub mod register;

pub use classic::SockFilter;
pub use error::BytecodeError;
pub use insn::{Insn, check_registers, decode_program, encode_program};
pub use prog_type::{AttachType, ProgType};
pub use register::Reg;

/// Size in bytes of one encoded instruction slot.
pub const INSN_SIZE: usize = 8;

/// Stack space available to a single program frame.
pub const MAX_BPF_STACK: usize = 512;

/// Number of bytes in a program tag.
pub const TAG_SIZE: usize = 8;

/// Maximum number of instructions in a classic program.
pub const MAX_CLASSIC_INSNS: usize = 4096;
