//! Portable code generator
//!
//! Lowers every instruction slot to a fixed 16-byte record with operands
//! pre-decoded and branch targets resolved to absolute slot indices:
//!
//! ```text
//! 0      1      2      3      4          8                16
//! +------+------+------+------+----------+----------------+
//! |  op  | dst  | src  | arg  |   imm    |      aux       |
//! +------+------+------+------+----------+----------------+
//! ```
//!
//! `arg` carries the ALU/jump operation, access width or byte-order kind.
//! `aux` carries a sign-extended operand, a memory offset, a branch target or
//! a 64-bit immediate. Unused space holds `0xcc`, which decodes as a trap.

use sieve_bytecode::Insn;
use sieve_bytecode::register::MAX_EXT_REG;
use sieve_bytecode::opcode::{alu, class, jmp, mode, size, src};

use crate::codegen::{CodeGenerator, Emitted};
use crate::error::{Declined, Fault};
use crate::vm::{self, Vm};

/// Size of one record
pub const RECORD_SIZE: usize = 16;

/// Poison byte
const TRAP_BYTE: u8 = 0xcc;

mod op {
    pub const ALU64_K: u8 = 1;
    pub const ALU64_X: u8 = 2;
    pub const ALU32_K: u8 = 3;
    pub const ALU32_X: u8 = 4;
    pub const END: u8 = 5;
    pub const LD_IMM64: u8 = 6;
    pub const LD_ABS: u8 = 7;
    pub const LD_IND: u8 = 8;
    pub const LDX: u8 = 9;
    pub const ST: u8 = 10;
    pub const STX: u8 = 11;
    pub const XADD: u8 = 12;
    pub const JA: u8 = 13;
    pub const JMP_K: u8 = 14;
    pub const JMP_X: u8 = 15;
    pub const JMP32_K: u8 = 16;
    pub const JMP32_X: u8 = 17;
    pub const CALL: u8 = 18;
    pub const CALL_REL: u8 = 19;
    pub const EXIT: u8 = 20;
    /// Second slot of a wide load; never reached
    pub const WIDE_TAIL: u8 = 21;
    pub const TRAP: u8 = super::TRAP_BYTE;
}

#[derive(Debug, Clone, Copy)]
struct Record {
    op: u8,
    dst: u8,
    src: u8,
    arg: u8,
    imm: i32,
    aux: u64,
}

impl Record {
    const fn new(op: u8, insn: &Insn, arg: u8, aux: u64) -> Self {
        Self {
            op,
            dst: insn.dst().index(),
            src: insn.src().index(),
            arg,
            imm: insn.imm,
            aux,
        }
    }

    fn write(&self, out: &mut [u8]) {
        out[0] = self.op;
        out[1] = self.dst;
        out[2] = self.src;
        out[3] = self.arg;
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out[8..16].copy_from_slice(&self.aux.to_le_bytes());
    }

    #[inline]
    fn read(image: &[u8], slot: usize) -> Option<Self> {
        let start = slot.checked_mul(RECORD_SIZE)?;
        let bytes = image.get(start..start + RECORD_SIZE)?;
        let mut imm = [0u8; 4];
        imm.copy_from_slice(&bytes[4..8]);
        let mut aux = [0u8; 8];
        aux.copy_from_slice(&bytes[8..16]);
        Some(Self {
            op: bytes[0],
            dst: bytes[1],
            src: bytes[2],
            arg: bytes[3],
            imm: i32::from_le_bytes(imm),
            aux: u64::from_le_bytes(aux),
        })
    }
}

/// Pre-decoding generator that runs on any host
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadedCodegen;

impl ThreadedCodegen {
    /// New generator
    pub fn new() -> Self {
        Self
    }

    fn target(pc: usize, rel: i64, len: usize) -> Result<u64, Declined> {
        let target = pc as i64 + 1 + rel;
        if target < 0 || target as usize >= len {
            return Err(Declined::BadTarget { pc });
        }
        Ok(target as u64)
    }

    fn lower(insns: &[Insn], pc: usize) -> Result<Record, Declined> {
        let insn = &insns[pc];
        let code = insn.code;
        let unsupported = Declined::Unsupported { pc, code };
        let sign_ext = insn.imm as i64 as u64;
        let width = || size::to_bytes(size::of(code)).map(|w| w as u8);

        let record = match insn.class() {
            cls @ (class::ALU | class::ALU64) => {
                let aluop = alu::of(code);
                if aluop == alu::END {
                    if !matches!(insn.imm, 16 | 32 | 64) {
                        return Err(unsupported);
                    }
                    Record::new(op::END, insn, src::of(code), 0)
                } else {
                    if vm::alu64(aluop, 0, 1).is_none() {
                        return Err(unsupported);
                    }
                    let is_x = src::of(code) == src::X;
                    let kind = match (cls == class::ALU64, is_x) {
                        (true, false) => op::ALU64_K,
                        (true, true) => op::ALU64_X,
                        (false, false) => op::ALU32_K,
                        (false, true) => op::ALU32_X,
                    };
                    Record::new(kind, insn, aluop, sign_ext)
                }
            }
            class::LD => match (mode::of(code), width()) {
                (mode::IMM, Some(8)) => {
                    let hi = insns.get(pc + 1).ok_or(unsupported)?;
                    let value = u64::from(insn.imm as u32) | (u64::from(hi.imm as u32) << 32);
                    Record::new(op::LD_IMM64, insn, 8, value)
                }
                (mode::ABS, Some(w)) if w <= 4 => Record::new(op::LD_ABS, insn, w, 0),
                (mode::IND, Some(w)) if w <= 4 => Record::new(op::LD_IND, insn, w, 0),
                _ => return Err(unsupported),
            },
            class::LDX => match (mode::of(code), width()) {
                (mode::MEM, Some(w)) => Record::new(op::LDX, insn, w, insn.off as i64 as u64),
                _ => return Err(unsupported),
            },
            class::ST => match (mode::of(code), width()) {
                (mode::MEM, Some(w)) => Record::new(op::ST, insn, w, insn.off as i64 as u64),
                _ => return Err(unsupported),
            },
            class::STX => match (mode::of(code), width()) {
                (mode::MEM, Some(w)) => Record::new(op::STX, insn, w, insn.off as i64 as u64),
                (mode::XADD, Some(w)) if w >= 4 => {
                    Record::new(op::XADD, insn, w, insn.off as i64 as u64)
                }
                _ => return Err(unsupported),
            },
            cls @ (class::JMP | class::JMP32) => {
                let jop = jmp::of(code);
                let len = insns.len();
                match jop {
                    jmp::JA if cls == class::JMP => {
                        let target = Self::target(pc, i64::from(insn.off), len)?;
                        Record::new(op::JA, insn, 0, target)
                    }
                    jmp::CALL if cls == class::JMP && insn.is_pseudo_call() => {
                        let target = Self::target(pc, i64::from(insn.imm), len)?;
                        Record::new(op::CALL_REL, insn, 0, target)
                    }
                    jmp::CALL if cls == class::JMP => Record::new(op::CALL, insn, 0, 0),
                    jmp::EXIT if cls == class::JMP => Record::new(op::EXIT, insn, 0, 0),
                    _ => {
                        if vm::jmp64(jop, 0, 0).is_none() {
                            return Err(unsupported);
                        }
                        let target = Self::target(pc, i64::from(insn.off), len)?;
                        let kind = match (cls == class::JMP, src::of(code) == src::X) {
                            (true, false) => op::JMP_K,
                            (true, true) => op::JMP_X,
                            (false, false) => op::JMP32_K,
                            (false, true) => op::JMP32_X,
                        };
                        Record::new(kind, insn, jop, target)
                    }
                }
            }
            _ => return Err(unsupported),
        };
        Ok(record)
    }
}

impl CodeGenerator for ThreadedCodegen {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn image_len(&self, insns: &[Insn]) -> usize {
        insns.len() * RECORD_SIZE
    }

    fn fill_hole(&self, area: &mut [u8]) {
        area.fill(TRAP_BYTE);
    }

    fn emit(&self, insns: &[Insn], image: &mut [u8]) -> Result<Emitted, Declined> {
        let need = self.image_len(insns);
        if image.len() < need {
            return Err(Declined::ImageTooSmall {
                need,
                have: image.len(),
            });
        }

        let mut insn_offsets = Vec::with_capacity(insns.len());
        let mut pc = 0;
        while pc < insns.len() {
            let insn = &insns[pc];
            if usize::from(insn.dst().index()) >= MAX_EXT_REG || usize::from(insn.src().index()) >= MAX_EXT_REG {
                return Err(Declined::Unsupported { pc, code: insn.code });
            }
            let record = Self::lower(insns, pc)?;
            let at = pc * RECORD_SIZE;
            record.write(&mut image[at..at + RECORD_SIZE]);
            insn_offsets.push(at as u32);
            if record.op == op::LD_IMM64 {
                let tail = Record::new(op::WIDE_TAIL, &insns[pc + 1], 0, 0);
                tail.write(&mut image[at + RECORD_SIZE..at + 2 * RECORD_SIZE]);
                insn_offsets.push((at + RECORD_SIZE) as u32);
                pc += 2;
            } else {
                pc += 1;
            }
        }

        Ok(Emitted {
            len: need,
            insn_offsets,
        })
    }

    fn execute(&self, image: &[u8], vm: &mut Vm<'_>) -> Result<u64, Fault> {
        let mut pc = 0usize;
        loop {
            let r = Record::read(image, pc).ok_or(Fault::PcOutOfRange { pc: pc as i64 })?;
            let dst = usize::from(r.dst);
            let src_reg = usize::from(r.src);
            let width = usize::from(r.arg);
            let invalid = Fault::InvalidOpcode { pc, code: r.op };

            match r.op {
                op::ALU64_K => {
                    vm.regs[dst] = vm::alu64(r.arg, vm.regs[dst], r.aux).ok_or(invalid)?;
                    pc += 1;
                }
                op::ALU64_X => {
                    vm.regs[dst] = vm::alu64(r.arg, vm.regs[dst], vm.regs[src_reg]).ok_or(invalid)?;
                    pc += 1;
                }
                op::ALU32_K => {
                    vm.regs[dst] =
                        vm::alu32(r.arg, vm.regs[dst] as u32, r.imm as u32).ok_or(invalid)?;
                    pc += 1;
                }
                op::ALU32_X => {
                    vm.regs[dst] = vm::alu32(r.arg, vm.regs[dst] as u32, vm.regs[src_reg] as u32)
                        .ok_or(invalid)?;
                    pc += 1;
                }
                op::END => {
                    vm.regs[dst] = vm::byte_swap(r.arg, r.imm, vm.regs[dst]).ok_or(invalid)?;
                    pc += 1;
                }
                op::LD_IMM64 => {
                    vm.regs[dst] = r.aux;
                    pc += 2;
                }
                op::LD_ABS | op::LD_IND => {
                    let off = if r.op == op::LD_ABS {
                        r.imm
                    } else {
                        vm::ind_offset(vm.regs[src_reg], r.imm)
                    };
                    match vm.load_packet(off, width) {
                        Some(value) => vm.regs[0] = value,
                        None => return Ok(0),
                    }
                    pc += 1;
                }
                op::LDX => {
                    let addr = vm.regs[src_reg].wrapping_add(r.aux);
                    vm.regs[dst] = vm.load(pc, addr, width)?;
                    pc += 1;
                }
                op::ST => {
                    let addr = vm.regs[dst].wrapping_add(r.aux);
                    vm.store(pc, addr, width, r.imm as i64 as u64)?;
                    pc += 1;
                }
                op::STX => {
                    let addr = vm.regs[dst].wrapping_add(r.aux);
                    vm.store(pc, addr, width, vm.regs[src_reg])?;
                    pc += 1;
                }
                op::XADD => {
                    let addr = vm.regs[dst].wrapping_add(r.aux);
                    vm.xadd(pc, addr, width, vm.regs[src_reg])?;
                    pc += 1;
                }
                op::JA => pc = r.aux as usize,
                op::JMP_K | op::JMP_X | op::JMP32_K | op::JMP32_X => {
                    let operand = if r.op == op::JMP_X || r.op == op::JMP32_X {
                        vm.regs[src_reg]
                    } else {
                        r.imm as i64 as u64
                    };
                    let taken = if r.op == op::JMP_K || r.op == op::JMP_X {
                        vm::jmp64(r.arg, vm.regs[dst], operand)
                    } else {
                        vm::jmp32(r.arg, vm.regs[dst], operand)
                    };
                    pc = if taken.ok_or(invalid)? {
                        r.aux as usize
                    } else {
                        pc + 1
                    };
                }
                op::CALL => {
                    vm.call_helper(pc, r.imm)?;
                    pc += 1;
                }
                op::CALL_REL => {
                    vm.push_call(pc, pc + 1)?;
                    pc = r.aux as usize;
                }
                op::EXIT => match vm.pop_return() {
                    Some(ret) => pc = ret,
                    None => return Ok(vm.regs[0]),
                },
                op::TRAP | op::WIDE_TAIL => return Err(Fault::Trap { slot: pc }),
                _ => return Err(invalid),
            }
        }
    }
}
