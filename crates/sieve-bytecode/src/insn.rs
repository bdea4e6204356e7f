//! Instruction word and constructors

use serde::{Deserialize, Serialize};

use crate::INSN_SIZE;
use crate::error::{BytecodeError, Result};
use crate::opcode::{self, alu, class, jmp, mode, size, src};
use crate::register::Reg;

/// One instruction slot.
///
/// Layout matches the wire format: opcode byte, destination register in the
/// low nibble and source register in the high nibble of the second byte, a
/// signed 16-bit offset and a signed 32-bit immediate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct Insn {
    /// Opcode byte
    pub code: u8,
    regs: u8,
    /// Jump displacement or memory offset
    pub off: i16,
    /// Immediate operand
    pub imm: i32,
}

impl Insn {
    /// Generic constructor; every other constructor is a shorthand for it.
    #[inline]
    pub const fn raw(code: u8, dst: Reg, src: Reg, off: i16, imm: i32) -> Self {
        Self {
            code,
            regs: (dst.0 & 0x0f) | (src.0 << 4),
            off,
            imm,
        }
    }

    /// Destination register
    #[inline]
    pub const fn dst(&self) -> Reg {
        Reg(self.regs & 0x0f)
    }

    /// Source register
    #[inline]
    pub const fn src(&self) -> Reg {
        Reg(self.regs >> 4)
    }

    /// Replace the destination register
    #[inline]
    pub fn set_dst(&mut self, dst: Reg) {
        self.regs = (self.regs & 0xf0) | (dst.0 & 0x0f);
    }

    /// Replace the source register
    #[inline]
    pub fn set_src(&mut self, src: Reg) {
        self.regs = (self.regs & 0x0f) | (src.0 << 4);
    }

    /// Instruction class
    #[inline]
    pub const fn class(&self) -> u8 {
        class::of(self.code)
    }

    /// Whether this slot starts a two-slot 64-bit immediate load
    #[inline]
    pub const fn is_ld_imm64(&self) -> bool {
        self.code == opcode::LD_IMM64
    }

    /// Whether this is a branch whose `off` field is a relative target
    pub const fn is_branch(&self) -> bool {
        let cls = self.class();
        if cls != class::JMP && cls != class::JMP32 {
            return false;
        }
        let op = jmp::of(self.code);
        op != jmp::CALL && op != jmp::EXIT
    }

    /// Whether this is a relative bpf-to-bpf call
    pub const fn is_pseudo_call(&self) -> bool {
        self.code == class::JMP | jmp::CALL && self.src().0 == opcode::PSEUDO_CALL
    }

    /// Number of bytes touched by a load or store, `None` for other classes
    pub const fn ldst_bytes(&self) -> Option<usize> {
        match self.class() {
            class::LD | class::LDX | class::ST | class::STX => size::to_bytes(size::of(self.code)),
            _ => None,
        }
    }

    // ==================== ALU ====================

    /// 64-bit register ALU op: `dst op= src`
    pub const fn alu64_reg(op: u8, dst: Reg, src: Reg) -> Self {
        Self::raw(class::ALU64 | alu::of(op) | src::X, dst, src, 0, 0)
    }

    /// 32-bit register ALU op: `dst op= src`
    pub const fn alu32_reg(op: u8, dst: Reg, src: Reg) -> Self {
        Self::raw(class::ALU | alu::of(op) | src::X, dst, src, 0, 0)
    }

    /// 64-bit immediate ALU op: `dst op= imm`
    pub const fn alu64_imm(op: u8, dst: Reg, imm: i32) -> Self {
        Self::raw(class::ALU64 | alu::of(op) | src::K, dst, Reg(0), 0, imm)
    }

    /// 32-bit immediate ALU op: `dst op= imm`
    pub const fn alu32_imm(op: u8, dst: Reg, imm: i32) -> Self {
        Self::raw(class::ALU | alu::of(op) | src::K, dst, Reg(0), 0, imm)
    }

    /// Byte order conversion of the low `len` bits of `dst`
    pub const fn endian(kind: u8, dst: Reg, len: i32) -> Self {
        Self::raw(class::ALU | alu::END | src::of(kind), dst, Reg(0), 0, len)
    }

    /// `dst = src` (64-bit)
    pub const fn mov64_reg(dst: Reg, src: Reg) -> Self {
        Self::alu64_reg(alu::MOV, dst, src)
    }

    /// `dst = (u32) src`
    pub const fn mov32_reg(dst: Reg, src: Reg) -> Self {
        Self::alu32_reg(alu::MOV, dst, src)
    }

    /// `dst = imm` (sign extended)
    pub const fn mov64_imm(dst: Reg, imm: i32) -> Self {
        Self::alu64_imm(alu::MOV, dst, imm)
    }

    /// `dst = (u32) imm`
    pub const fn mov32_imm(dst: Reg, imm: i32) -> Self {
        Self::alu32_imm(alu::MOV, dst, imm)
    }

    /// 64-bit move whose operand source is chosen by `kind` (`src::K` or `src::X`)
    pub const fn mov64_raw(kind: u8, dst: Reg, src: Reg, imm: i32) -> Self {
        Self::raw(class::ALU64 | alu::MOV | src::of(kind), dst, src, 0, imm)
    }

    /// 32-bit move whose operand source is chosen by `kind`
    pub const fn mov32_raw(kind: u8, dst: Reg, src: Reg, imm: i32) -> Self {
        Self::raw(class::ALU | alu::MOV | src::of(kind), dst, src, 0, imm)
    }

    /// Explicit zero extension of the low half of `dst`
    pub const fn zext_reg(dst: Reg) -> Self {
        Self::raw(class::ALU | alu::MOV | src::X, dst, dst, 0, 1)
    }

    // ==================== Loads and stores ====================

    /// `dst = imm64`, two slots
    pub const fn ld_imm64(dst: Reg, imm: u64) -> [Self; 2] {
        Self::ld_imm64_raw(dst, Reg(0), imm)
    }

    /// Wide load with an explicit `src` marker, two slots
    pub const fn ld_imm64_raw(dst: Reg, src: Reg, imm: u64) -> [Self; 2] {
        [
            Self::raw(opcode::LD_IMM64, dst, src, 0, imm as u32 as i32),
            // zero is the reserved opcode of the second half
            Self::raw(0, Reg(0), Reg(0), 0, (imm >> 32) as u32 as i32),
        ]
    }

    /// Wide load that references map `fd` of the loading process
    pub const fn ld_map_fd(dst: Reg, fd: i32) -> [Self; 2] {
        Self::ld_imm64_raw(dst, Reg(opcode::PSEUDO_MAP_FD), fd as u32 as u64)
    }

    /// `R0 = ntoh(*(size *)(packet + imm))`
    pub const fn ld_abs(sz: u8, imm: i32) -> Self {
        Self::raw(class::LD | size::of(sz) | mode::ABS, Reg(0), Reg(0), 0, imm)
    }

    /// `R0 = ntoh(*(size *)(packet + src + imm))`
    pub const fn ld_ind(sz: u8, src: Reg, imm: i32) -> Self {
        Self::raw(class::LD | size::of(sz) | mode::IND, Reg(0), src, 0, imm)
    }

    /// `dst = *(size *)(src + off)`
    pub const fn ldx_mem(sz: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::raw(class::LDX | size::of(sz) | mode::MEM, dst, src, off, 0)
    }

    /// `*(size *)(dst + off) = src`
    pub const fn stx_mem(sz: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::raw(class::STX | size::of(sz) | mode::MEM, dst, src, off, 0)
    }

    /// `*(size *)(dst + off) += src`, atomically
    pub const fn stx_xadd(sz: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::raw(class::STX | size::of(sz) | mode::XADD, dst, src, off, 0)
    }

    /// `*(size *)(dst + off) = imm`
    pub const fn st_mem(sz: u8, dst: Reg, off: i16, imm: i32) -> Self {
        Self::raw(class::ST | size::of(sz) | mode::MEM, dst, Reg(0), off, imm)
    }

    // ==================== Control flow ====================

    /// `if (dst op src) goto pc + off`
    pub const fn jmp_reg(op: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::raw(class::JMP | jmp::of(op) | src::X, dst, src, off, 0)
    }

    /// `if (dst op imm) goto pc + off`
    pub const fn jmp_imm(op: u8, dst: Reg, imm: i32, off: i16) -> Self {
        Self::raw(class::JMP | jmp::of(op) | src::K, dst, Reg(0), off, imm)
    }

    /// Like [`Insn::jmp_reg`] with 32-bit wide operands
    pub const fn jmp32_reg(op: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Self::raw(class::JMP32 | jmp::of(op) | src::X, dst, src, off, 0)
    }

    /// Like [`Insn::jmp_imm`] with 32-bit wide operands
    pub const fn jmp32_imm(op: u8, dst: Reg, imm: i32, off: i16) -> Self {
        Self::raw(class::JMP32 | jmp::of(op) | src::K, dst, Reg(0), off, imm)
    }

    /// `goto pc + off`
    pub const fn ja(off: i16) -> Self {
        Self::raw(class::JMP | jmp::JA, Reg(0), Reg(0), off, 0)
    }

    /// Relative call to the function starting at `pc + target + 1`
    pub const fn call_rel(target: i32) -> Self {
        Self::raw(class::JMP | jmp::CALL, Reg(0), Reg(opcode::PSEUDO_CALL), 0, target)
    }

    /// Helper call; `func` is the helper's id
    pub const fn emit_call(func: i32) -> Self {
        Self::raw(class::JMP | jmp::CALL, Reg(0), Reg(0), 0, func)
    }

    /// Return R0
    pub const fn exit() -> Self {
        Self::raw(class::JMP | jmp::EXIT, Reg(0), Reg(0), 0, 0)
    }

    // ==================== Codec ====================

    /// Encode into the little-endian wire format
    pub fn to_bytes(&self) -> [u8; INSN_SIZE] {
        let mut out = [0u8; INSN_SIZE];
        out[0] = self.code;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.off.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    /// Decode one slot from the wire format
    pub fn from_bytes(bytes: [u8; INSN_SIZE]) -> Self {
        Self {
            code: bytes[0],
            regs: bytes[1],
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Serialize a program into contiguous slots
pub fn encode_program(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * INSN_SIZE);
    for insn in insns {
        out.extend_from_slice(&insn.to_bytes());
    }
    out
}

/// Reject any slot naming a register outside R0-R10. The second half of a
/// wide load carries no registers and is checked like any other slot.
pub fn check_registers(insns: &[Insn]) -> Result<()> {
    for (pc, insn) in insns.iter().enumerate() {
        for reg in [insn.dst(), insn.src()] {
            if !reg.is_valid() {
                return Err(BytecodeError::InvalidRegister { pc, reg: reg.0 });
            }
        }
    }
    Ok(())
}

/// Parse contiguous slots, checking register indices and wide-load pairing
pub fn decode_program(bytes: &[u8]) -> Result<Vec<Insn>> {
    if bytes.is_empty() {
        return Err(BytecodeError::Empty);
    }
    if bytes.len() % INSN_SIZE != 0 {
        return Err(BytecodeError::Truncated {
            len: bytes.len(),
            slot: INSN_SIZE,
        });
    }

    let mut insns = Vec::with_capacity(bytes.len() / INSN_SIZE);
    for (pc, chunk) in bytes.chunks_exact(INSN_SIZE).enumerate() {
        let mut slot = [0u8; INSN_SIZE];
        slot.copy_from_slice(chunk);
        insns.push(Insn::from_bytes(slot));
    }
    check_registers(&insns)?;

    let mut pc = 0;
    while pc < insns.len() {
        if insns[pc].is_ld_imm64() {
            if pc + 1 >= insns.len() {
                return Err(BytecodeError::MissingWideHalf(pc));
            }
            pc += 1;
        }
        pc += 1;
    }
    Ok(insns)
}
