//! Register file

use serde::{Deserialize, Serialize};

/// Virtual register (R0-R10 plus the hidden AX)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Reg(pub u8);

impl Reg {
    /// Return value / classic accumulator
    pub const R0: Reg = Reg(0);
    /// First argument, context pointer on entry
    pub const R1: Reg = Reg(1);
    /// Second argument
    pub const R2: Reg = Reg(2);
    /// Third argument
    pub const R3: Reg = Reg(3);
    /// Fourth argument
    pub const R4: Reg = Reg(4);
    /// Fifth argument
    pub const R5: Reg = Reg(5);
    /// Callee saved
    pub const R6: Reg = Reg(6);
    /// Callee saved
    pub const R7: Reg = Reg(7);
    /// Callee saved
    pub const R8: Reg = Reg(8);
    /// Callee saved
    pub const R9: Reg = Reg(9);
    /// Read-only frame pointer
    pub const R10: Reg = Reg(10);
    /// Hidden auxiliary register, only written by the hardening pass
    pub const AX: Reg = Reg(MAX_REG);

    /// Helper argument registers.
    pub const ARG1: Reg = Reg::R1;
    /// Second helper argument
    pub const ARG2: Reg = Reg::R2;
    /// Third helper argument
    pub const ARG3: Reg = Reg::R3;
    /// Fourth helper argument
    pub const ARG4: Reg = Reg::R4;
    /// Fifth helper argument
    pub const ARG5: Reg = Reg::R5;
    /// Context pointer kept in a callee-saved register
    pub const CTX: Reg = Reg::R6;
    /// Frame pointer
    pub const FP: Reg = Reg::R10;

    /// Classic accumulator after migration
    pub const A: Reg = Reg::R0;
    /// Classic index register after migration
    pub const X: Reg = Reg::R7;
    /// Scratch register used by migrated sequences
    pub const TMP: Reg = Reg::R2;
    /// Packet data, callee saved
    pub const D: Reg = Reg::R8;
    /// Header length, callee saved
    pub const H: Reg = Reg::R9;

    /// Create a new register
    #[inline]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Get register index
    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Whether programs may name this register. AX is reserved for the
    /// hardening pass.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_REG
    }
}

impl From<u8> for Reg {
    fn from(index: u8) -> Self {
        Self(index)
    }
}

/// Number of registers visible to programs (R0-R10).
pub const MAX_REG: u8 = 11;

/// Number of registers including the hidden AX.
pub const MAX_EXT_REG: usize = MAX_REG as usize + 1;
