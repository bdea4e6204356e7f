//! Constant blinding
//!
//! Every user-controlled immediate is replaced by `rnd ^ imm` loaded into the
//! hidden AX register followed by `AX ^= rnd`, so the raw constant never
//! appears in the emitted image. Branch displacements and relative call
//! immediates are recomputed over the rewritten program.

use rand::{Rng, RngCore};
use sieve_bytecode::opcode::{alu, class, jmp, mode, size, src};
use sieve_bytecode::{Insn, Reg};

use crate::error::BlindError;

/// Result of blinding a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blinded {
    /// Rewritten instructions
    pub insns: Vec<Insn>,
    /// `addrs[i]` is the new index of the first instruction emitted for input
    /// slot `i`; `addrs[len]` is the new length
    pub addrs: Vec<usize>,
}

impl Blinded {
    /// New index of input slot `pc`
    pub fn map_pc(&self, pc: usize) -> Option<usize> {
        self.addrs.get(pc).copied()
    }
}

/// Blind `insns` with masks drawn from the thread-local generator
pub fn blind_program(insns: &[Insn]) -> Result<Blinded, BlindError> {
    blind_program_with(insns, &mut rand::rng())
}

/// Blind `insns` with masks drawn from `rng`
pub fn blind_program_with<R: RngCore + ?Sized>(
    insns: &[Insn],
    rng: &mut R,
) -> Result<Blinded, BlindError> {
    let mut out = Vec::with_capacity(insns.len() * 2);
    let mut addrs = Vec::with_capacity(insns.len() + 1);
    // (new position, old pc) of every instruction whose target needs relocation
    let mut carried = Vec::new();

    let mut pc = 0;
    while pc < insns.len() {
        let insn = insns[pc];
        addrs.push(out.len());

        if insn.is_ld_imm64() && pc + 1 < insns.len() {
            let hi = insns[pc + 1];
            if touches_ax(&insn) {
                out.push(insn);
                addrs.push(out.len());
                out.push(hi);
            } else {
                blind_wide_hi(&insn, &hi, rng.random(), &mut out);
                addrs.push(out.len());
                blind_wide_lo(&insn, rng.random(), &mut out);
            }
            pc += 2;
            continue;
        }

        let patch = blind_insn(&insn, rng.random());
        let emitted = patch.as_slice();
        if emitted.is_empty() {
            out.push(insn);
        } else {
            out.extend_from_slice(emitted);
        }
        if insn.is_branch() || insn.is_pseudo_call() {
            carried.push((out.len() - 1, pc));
        }
        pc += 1;
    }
    addrs.push(out.len());

    for (new_pc, old_pc) in carried {
        let old = &insns[old_pc];
        let rel = if old.is_pseudo_call() {
            i64::from(old.imm)
        } else {
            i64::from(old.off)
        };
        let target = old_pc as i64 + 1 + rel;
        if target < 0 || target as usize >= addrs.len() {
            return Err(BlindError::BadTarget {
                pc: old_pc,
                target,
                len: insns.len(),
            });
        }
        let offset = addrs[target as usize] as i64 - new_pc as i64 - 1;
        let slot = &mut out[new_pc];
        if old.is_pseudo_call() {
            slot.imm = i32::try_from(offset)
                .map_err(|_| BlindError::CallOutOfRange { pc: new_pc, offset })?;
        } else {
            slot.off = i16::try_from(offset)
                .map_err(|_| BlindError::BranchOutOfRange { pc: new_pc, offset })?;
        }
    }

    tracing::debug!(
        target: "sieve::jit",
        before = insns.len(),
        after = out.len(),
        "constants blinded"
    );
    Ok(Blinded { insns: out, addrs })
}

fn touches_ax(insn: &Insn) -> bool {
    insn.dst() == Reg::AX || insn.src() == Reg::AX
}

fn is_blindable_alu(op: u8) -> bool {
    !matches!(op, alu::NEG | alu::END)
}

fn is_blindable_jmp(op: u8) -> bool {
    !matches!(op, jmp::JA | jmp::CALL | jmp::EXIT)
}

/// Rewrite a single-slot instruction; an empty patch keeps it unchanged
fn blind_insn(from: &Insn, rnd: u32) -> Patch {
    let mut to = Patch::new();
    if touches_ax(from) {
        return to;
    }

    let rnd = rnd as i32;
    let masked = rnd ^ from.imm;
    let code = from.code;
    let cls = from.class();

    if from.imm == 0
        && (code == class::ALU | alu::MOV | src::K || code == class::ALU64 | alu::MOV | src::K)
    {
        to.push(Insn::alu64_reg(alu::XOR, from.dst(), from.dst()));
        return to;
    }

    match cls {
        class::ALU | class::ALU64 if src::of(code) == src::K && is_blindable_alu(alu::of(code)) => {
            let op = alu::of(code);
            if cls == class::ALU {
                to.push(Insn::alu32_imm(alu::MOV, Reg::AX, masked));
                to.push(Insn::alu32_imm(alu::XOR, Reg::AX, rnd));
                to.push(Insn::alu32_reg(op, from.dst(), Reg::AX));
            } else {
                to.push(Insn::alu64_imm(alu::MOV, Reg::AX, masked));
                to.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
                to.push(Insn::alu64_reg(op, from.dst(), Reg::AX));
            }
        }
        class::JMP | class::JMP32 if src::of(code) == src::K && is_blindable_jmp(jmp::of(code)) => {
            let op = jmp::of(code);
            to.push(Insn::alu64_imm(alu::MOV, Reg::AX, masked));
            to.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
            // displacement is fixed up by the caller
            if cls == class::JMP {
                to.push(Insn::jmp_reg(op, from.dst(), Reg::AX, from.off));
            } else {
                to.push(Insn::jmp32_reg(op, from.dst(), Reg::AX, from.off));
            }
        }
        class::LD if mode::of(code) == mode::ABS => {
            to.push(Insn::alu64_imm(alu::MOV, Reg::AX, masked));
            to.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
            to.push(Insn::ld_ind(size::of(code), Reg::AX, 0));
        }
        class::LD if mode::of(code) == mode::IND => {
            to.push(Insn::alu64_imm(alu::MOV, Reg::AX, masked));
            to.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
            to.push(Insn::alu32_reg(alu::ADD, Reg::AX, from.src()));
            to.push(Insn::ld_ind(size::of(code), Reg::AX, 0));
        }
        class::ST if mode::of(code) == mode::MEM => {
            to.push(Insn::alu64_imm(alu::MOV, Reg::AX, masked));
            to.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
            to.push(Insn::stx_mem(size::of(code), from.dst(), Reg::AX, from.off));
        }
        _ => {}
    }
    to
}

/// First half of a wide load: `dst = hi << 32`
fn blind_wide_hi(lo: &Insn, hi: &Insn, rnd: u32, out: &mut Vec<Insn>) {
    let rnd = rnd as i32;
    out.push(Insn::alu64_imm(alu::MOV, Reg::AX, rnd ^ hi.imm));
    out.push(Insn::alu64_imm(alu::XOR, Reg::AX, rnd));
    out.push(Insn::alu64_imm(alu::LSH, Reg::AX, 32));
    out.push(Insn::alu64_reg(alu::MOV, lo.dst(), Reg::AX));
}

/// Second half of a wide load: `dst |= (u32) lo`
fn blind_wide_lo(lo: &Insn, rnd: u32, out: &mut Vec<Insn>) {
    let rnd = rnd as i32;
    out.push(Insn::alu32_imm(alu::MOV, Reg::AX, rnd ^ lo.imm));
    out.push(Insn::alu32_imm(alu::XOR, Reg::AX, rnd));
    out.push(Insn::alu64_reg(alu::OR, lo.dst(), Reg::AX));
}

/// Longest rewrite of a single slot
const MAX_PATCH: usize = 4;

/// Fixed-capacity instruction buffer for one rewrite
struct Patch {
    buf: [Insn; MAX_PATCH],
    len: usize,
}

impl Patch {
    fn new() -> Self {
        Self {
            buf: [Insn::default(); MAX_PATCH],
            len: 0,
        }
    }

    fn push(&mut self, insn: Insn) {
        self.buf[self.len] = insn;
        self.len += 1;
    }

    fn as_slice(&self) -> &[Insn] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn blind(insns: &[Insn]) -> Blinded {
        blind_program_with(insns, &mut SmallRng::seed_from_u64(7)).expect("blind")
    }

    #[test]
    fn test_mov_zero_becomes_xor() {
        let out = blind(&[Insn::mov64_imm(Reg::R3, 0), Insn::exit()]);
        assert_eq!(out.insns[0], Insn::alu64_reg(alu::XOR, Reg::R3, Reg::R3));
        assert_eq!(out.insns.len(), 2);
    }

    #[test]
    fn test_immediate_is_hidden() {
        let secret = 0x1337_c0de;
        let out = blind(&[Insn::mov64_imm(Reg::R0, secret), Insn::exit()]);
        assert_eq!(out.insns.len(), 4);
        assert!(out.insns.iter().all(|insn| insn.imm != secret));
        assert_eq!(out.insns[0].imm ^ out.insns[1].imm, secret);
        assert_eq!(out.insns[2], Insn::mov64_reg(Reg::R0, Reg::AX));
    }

    #[test]
    fn test_ax_users_are_untouched() {
        let insn = Insn::alu64_imm(alu::ADD, Reg::AX, 9);
        let out = blind(&[insn, Insn::exit()]);
        assert_eq!(out.insns, vec![insn, Insn::exit()]);
    }

    #[test]
    fn test_branches_are_relocated() {
        // 0: if r1 == 5 goto 3
        // 1: r0 = 1
        // 2: exit
        // 3: r0 = 2
        // 4: exit
        let prog = [
            Insn::jmp_imm(jmp::JEQ, Reg::R1, 5, 2),
            Insn::mov64_imm(Reg::R0, 1),
            Insn::exit(),
            Insn::mov64_imm(Reg::R0, 2),
            Insn::exit(),
        ];
        let out = blind(&prog);
        assert_eq!(out.addrs, vec![0, 3, 6, 7, 10, 11]);
        let jump = out.insns[2];
        assert_eq!(jump.src(), Reg::AX);
        assert_eq!(2 + 1 + jump.off as usize, out.addrs[3]);
    }

    #[test]
    fn test_backward_ja_is_relocated() {
        let prog = [
            Insn::alu64_imm(alu::ADD, Reg::R0, 1),
            Insn::jmp_imm(jmp::JGT, Reg::R0, 10, 1),
            Insn::ja(-3),
            Insn::exit(),
        ];
        let out = blind(&prog);
        let ja_pos = out.addrs[2];
        let ja = out.insns[ja_pos];
        assert_eq!(ja, Insn::ja(ja.off));
        assert_eq!(ja_pos as i64 + 1 + ja.off as i64, 0);
    }

    #[test]
    fn test_wide_load_halves() {
        let [lo, hi] = Insn::ld_imm64(Reg::R4, 0xdead_beef_0bad_f00d);
        let out = blind(&[lo, hi, Insn::exit()]);
        assert_eq!(out.addrs, vec![0, 4, 7, 8]);
        assert!(out.insns.iter().all(|insn| !insn.is_ld_imm64()));
        assert_eq!(out.insns[6], Insn::alu64_reg(alu::OR, Reg::R4, Reg::AX));
    }

    #[test]
    fn test_pseudo_call_relocated() {
        let prog = [
            Insn::call_rel(1),
            Insn::exit(),
            Insn::mov64_imm(Reg::R0, 42),
            Insn::exit(),
        ];
        let out = blind(&prog);
        let call = out.insns[0];
        assert!(call.is_pseudo_call());
        assert_eq!(1 + call.imm as usize, out.addrs[2]);
    }

    #[test]
    fn test_overflowing_branch_is_rejected() {
        let mut prog = vec![Insn::jmp_imm(jmp::JEQ, Reg::R1, 1, 20_000)];
        prog.extend(std::iter::repeat_n(Insn::mov64_imm(Reg::R0, 1), 20_000));
        prog.push(Insn::exit());
        let err = blind_program_with(&prog, &mut SmallRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, BlindError::BranchOutOfRange { .. }));
    }
}
