//! Opcode field layout
//!
//! An opcode byte is `class | op | source` for ALU and jump classes, and
//! `class | size | mode` for load and store classes.

/// Instruction classes (low three bits)
pub mod class {
    /// Load (immediate, packet)
    pub const LD: u8 = 0x00;
    /// Load from memory into register
    pub const LDX: u8 = 0x01;
    /// Store immediate
    pub const ST: u8 = 0x02;
    /// Store register
    pub const STX: u8 = 0x03;
    /// 32-bit arithmetic
    pub const ALU: u8 = 0x04;
    /// 64-bit compare-and-jump, calls, exit
    pub const JMP: u8 = 0x05;
    /// 32-bit compare-and-jump
    pub const JMP32: u8 = 0x06;
    /// 64-bit arithmetic
    pub const ALU64: u8 = 0x07;
    /// Classic return (shares its value with `JMP32`)
    pub const RET: u8 = 0x06;
    /// Classic register transfer (shares its value with `ALU64`)
    pub const MISC: u8 = 0x07;

    /// Extract the class bits
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0x07
    }
}

/// Access width (load/store classes)
pub mod size {
    /// 32-bit word
    pub const W: u8 = 0x00;
    /// 16-bit half word
    pub const H: u8 = 0x08;
    /// 8-bit byte
    pub const B: u8 = 0x10;
    /// 64-bit double word
    pub const DW: u8 = 0x18;

    /// Extract the size bits
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0x18
    }

    /// Map a byte count onto a size field
    pub const fn from_bytes(bytes: usize) -> Option<u8> {
        match bytes {
            1 => Some(B),
            2 => Some(H),
            4 => Some(W),
            8 => Some(DW),
            _ => None,
        }
    }

    /// Map a size field onto a byte count
    pub const fn to_bytes(size: u8) -> Option<usize> {
        match size {
            B => Some(1),
            H => Some(2),
            W => Some(4),
            DW => Some(8),
            _ => None,
        }
    }
}

/// Addressing mode (load/store classes)
pub mod mode {
    /// Immediate (64-bit wide load)
    pub const IMM: u8 = 0x00;
    /// Absolute packet offset
    pub const ABS: u8 = 0x20;
    /// Packet offset relative to a register
    pub const IND: u8 = 0x40;
    /// Regular memory
    pub const MEM: u8 = 0x60;
    /// Classic packet length
    pub const LEN: u8 = 0x80;
    /// Classic IP header length helper
    pub const MSH: u8 = 0xa0;
    /// Atomic add
    pub const XADD: u8 = 0xc0;

    /// Extract the mode bits
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0xe0
    }
}

/// Arithmetic operations
pub mod alu {
    /// dst += src
    pub const ADD: u8 = 0x00;
    /// dst -= src
    pub const SUB: u8 = 0x10;
    /// dst *= src
    pub const MUL: u8 = 0x20;
    /// dst /= src
    pub const DIV: u8 = 0x30;
    /// dst |= src
    pub const OR: u8 = 0x40;
    /// dst &= src
    pub const AND: u8 = 0x50;
    /// dst <<= src
    pub const LSH: u8 = 0x60;
    /// dst >>= src (logical)
    pub const RSH: u8 = 0x70;
    /// dst = -dst
    pub const NEG: u8 = 0x80;
    /// dst %= src
    pub const MOD: u8 = 0x90;
    /// dst ^= src
    pub const XOR: u8 = 0xa0;
    /// dst = src
    pub const MOV: u8 = 0xb0;
    /// dst >>= src (arithmetic)
    pub const ARSH: u8 = 0xc0;
    /// Byte order conversion
    pub const END: u8 = 0xd0;

    /// Extract the operation bits
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0xf0
    }
}

/// Jump operations
pub mod jmp {
    /// pc += off
    pub const JA: u8 = 0x00;
    /// ==
    pub const JEQ: u8 = 0x10;
    /// > unsigned
    pub const JGT: u8 = 0x20;
    /// >= unsigned
    pub const JGE: u8 = 0x30;
    /// dst & src
    pub const JSET: u8 = 0x40;
    /// !=
    pub const JNE: u8 = 0x50;
    /// > signed
    pub const JSGT: u8 = 0x60;
    /// >= signed
    pub const JSGE: u8 = 0x70;
    /// Helper or bpf-to-bpf call
    pub const CALL: u8 = 0x80;
    /// Return R0
    pub const EXIT: u8 = 0x90;
    /// < unsigned
    pub const JLT: u8 = 0xa0;
    /// <= unsigned
    pub const JLE: u8 = 0xb0;
    /// < signed
    pub const JSLT: u8 = 0xc0;
    /// <= signed
    pub const JSLE: u8 = 0xd0;

    /// Extract the operation bits
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0xf0
    }
}

/// Operand source
pub mod src {
    /// 32-bit immediate
    pub const K: u8 = 0x00;
    /// Source register
    pub const X: u8 = 0x08;
    /// Classic: accumulator (return value source)
    pub const A: u8 = 0x10;

    /// Extract the source bit
    #[inline]
    pub const fn of(code: u8) -> u8 {
        code & 0x08
    }
}

/// Byte order targets for `alu::END`
pub mod endian {
    /// Convert to little endian
    pub const TO_LE: u8 = 0x00;
    /// Convert to big endian
    pub const TO_BE: u8 = 0x08;
    /// Convert from big endian (same encoding as `TO_BE`)
    pub const FROM_BE: u8 = TO_BE;
    /// Convert from little endian (same encoding as `TO_LE`)
    pub const FROM_LE: u8 = TO_LE;
}

/// Classic register transfer operations
pub mod misc {
    /// X = A
    pub const TAX: u8 = 0x00;
    /// A = X
    pub const TXA: u8 = 0x80;

    /// Extract the transfer bits
    #[inline]
    pub const fn of(code: u16) -> u16 {
        code & 0xf8
    }
}

/// `src_reg` marker on a call: relative bpf-to-bpf call
pub const PSEUDO_CALL: u8 = 1;

/// `src_reg` marker on a wide load: the immediate names a map
pub const PSEUDO_MAP_FD: u8 = 1;

/// Reserved opcode marking a tail call
pub const TAIL_CALL: u8 = 0xf0;

/// Reserved opcode marking an interpreter call with arguments
pub const CALL_ARGS: u8 = 0xe0;

/// Opcode of the first slot of a 64-bit immediate load
pub const LD_IMM64: u8 = class::LD | size::DW | mode::IMM;
