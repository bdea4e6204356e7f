//! Classic program migration
//!
//! Classic socket filters are checked structurally, their ancillary loads
//! are tagged, and the result is rewritten onto the current instruction set:
//!
//! | classic | current          |
//! |---------|------------------|
//! | `A`     | `R0`             |
//! | `X`     | `R7`             |
//! | `M[k]`  | `*(u32 *)(R10 - (k * 4 + 4))` |
//! | ctx     | `R6`, copied from `R1` in the prologue |

use sieve_bytecode::classic::{BPF_ANC, MEMWORDS, ancillary, ancillary_k};
use sieve_bytecode::opcode::{alu, class, endian, jmp, misc, mode, size, src};
use sieve_bytecode::{Insn, MAX_CLASSIC_INSNS, Reg, SockFilter, helper_id};

use crate::context::skb;
use crate::error::MigrateError;

const LD_W_ABS: u16 = (class::LD | size::W | mode::ABS) as u16;
const LD_H_ABS: u16 = (class::LD | size::H | mode::ABS) as u16;
const LD_B_ABS: u16 = (class::LD | size::B | mode::ABS) as u16;
const LD_W_LEN: u16 = (class::LD | size::W | mode::LEN) as u16;
const LD_MEM: u16 = (class::LD | mode::MEM) as u16;
const LDX_MEM: u16 = (class::LDX | mode::MEM) as u16;
const LDX_B_MSH: u16 = (class::LDX | size::B | mode::MSH) as u16;
const ST: u16 = class::ST as u16;
const STX: u16 = class::STX as u16;
const JA: u16 = (class::JMP | jmp::JA) as u16;
const RET_K: u16 = (class::RET | src::K) as u16;
const RET_A: u16 = (class::RET | src::A) as u16;

/// Opcode with ancillary loads tagged as `BPF_ANC | kind`; any other
/// instruction keeps its code
pub fn ancillary_code(insn: &SockFilter) -> u16 {
    match insn.code {
        LD_W_ABS | LD_H_ABS | LD_B_ABS => match ancillary_kind(insn.k) {
            Some(kind) if ancillary::ALL.contains(&kind) => BPF_ANC | kind as u16,
            _ => insn.code,
        },
        _ => insn.code,
    }
}

fn ancillary_kind(k: u32) -> Option<u32> {
    k.checked_sub(ancillary_k(0))
}

/// Whether the migrated program must clear `A` before `first` runs
pub fn needs_clear_a(first: &SockFilter) -> bool {
    match first.code {
        RET_K | LD_W_LEN => false,
        LD_W_ABS | LD_H_ABS | LD_B_ABS => first.k != ancillary_k(ancillary::ALU_XOR_X),
        code => code != BPF_ANC | ancillary::ALU_XOR_X as u16,
    }
}

fn code_allowed(code: u16) -> bool {
    let Ok(c) = u8::try_from(code) else {
        return false;
    };
    match class::of(c) {
        class::LD => matches!(
            c,
            0x00 | 0x20 | 0x28 | 0x30 | 0x40 | 0x48 | 0x50 | 0x60 | 0x80
        ),
        class::LDX => matches!(c, 0x01 | 0x61 | 0x81 | 0xb1),
        class::ST => c == class::ST,
        class::STX => c == class::STX,
        class::ALU => match alu::of(c) {
            alu::NEG => src::of(c) == src::K,
            alu::ADD
            | alu::SUB
            | alu::MUL
            | alu::DIV
            | alu::MOD
            | alu::AND
            | alu::OR
            | alu::XOR
            | alu::LSH
            | alu::RSH => true,
            _ => false,
        },
        class::JMP => match jmp::of(c) {
            jmp::JA => src::of(c) == src::K,
            jmp::JEQ | jmp::JGT | jmp::JGE | jmp::JSET => true,
            _ => false,
        },
        class::RET => code == RET_K || code == RET_A,
        _ => matches!(c, 0x07 | 0x87),
    }
}

fn is_cond_jump(code: u16) -> bool {
    code_allowed(code) && class::of(code as u8) == class::JMP && code != JA
}

/// Structural check of a classic program
pub fn check_classic(filter: &[SockFilter]) -> Result<(), MigrateError> {
    let flen = filter.len();
    if flen == 0 {
        return Err(MigrateError::Empty);
    }
    if flen > MAX_CLASSIC_INSNS {
        return Err(MigrateError::TooLong(flen));
    }

    for (pc, insn) in filter.iter().enumerate() {
        if !code_allowed(insn.code) {
            return Err(MigrateError::UnknownOpcode { pc, code: insn.code });
        }
        let c = insn.code as u8;
        match c {
            _ if class::of(c) == class::ALU && src::of(c) == src::K => match alu::of(c) {
                alu::DIV | alu::MOD if insn.k == 0 => {
                    return Err(MigrateError::DivisionByZero { pc });
                }
                alu::LSH | alu::RSH if insn.k >= 32 => {
                    return Err(MigrateError::ShiftTooLarge { pc, k: insn.k });
                }
                _ => {}
            },
            _ if matches!(insn.code, LD_MEM | LDX_MEM | ST | STX) => {
                if insn.k >= MEMWORDS {
                    return Err(MigrateError::ScratchOutOfRange { pc, k: insn.k });
                }
            }
            _ if insn.code == JA => {
                if insn.k as usize >= flen - pc - 1 {
                    return Err(MigrateError::JumpOutOfRange { pc });
                }
            }
            _ if is_cond_jump(insn.code) => {
                if pc + usize::from(insn.jt) + 1 >= flen || pc + usize::from(insn.jf) + 1 >= flen {
                    return Err(MigrateError::JumpOutOfRange { pc });
                }
            }
            _ if matches!(insn.code, LD_W_ABS | LD_H_ABS | LD_B_ABS) => {
                if let Some(kind) = ancillary_kind(insn.k)
                    && !ancillary::ALL.contains(&kind)
                {
                    return Err(MigrateError::UnknownAncillary { pc, k: insn.k });
                }
            }
            _ => {}
        }
    }

    if !matches!(filter[flen - 1].code, RET_K | RET_A) {
        return Err(MigrateError::MissingReturn);
    }
    check_loads_and_stores(filter)
}

/// Every scratch read must be preceded by a store on all paths
fn check_loads_and_stores(filter: &[SockFilter]) -> Result<(), MigrateError> {
    let mut masks = vec![u16::MAX; filter.len()];
    let mut memvalid: u16 = 0;

    for (pc, insn) in filter.iter().enumerate() {
        memvalid &= masks[pc];
        match insn.code {
            ST | STX => memvalid |= 1 << insn.k,
            LD_MEM | LDX_MEM => {
                if memvalid & (1 << insn.k) == 0 {
                    return Err(MigrateError::UninitializedScratch { pc, k: insn.k });
                }
            }
            JA => {
                masks[pc + 1 + insn.k as usize] &= memvalid;
                memvalid = u16::MAX;
            }
            code if is_cond_jump(code) => {
                masks[pc + 1 + usize::from(insn.jt)] &= memvalid;
                masks[pc + 1 + usize::from(insn.jf)] &= memvalid;
                memvalid = u16::MAX;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check, tag and convert a classic program
pub fn migrate(filter: &[SockFilter]) -> Result<Vec<Insn>, MigrateError> {
    check_classic(filter)?;
    let tagged: Vec<SockFilter> = filter
        .iter()
        .map(|insn| SockFilter {
            code: ancillary_code(insn),
            ..*insn
        })
        .collect();
    let insns = Converter::new(tagged.len()).convert(&tagged)?;
    tracing::debug!(
        target: "sieve::load",
        classic = filter.len(),
        converted = insns.len(),
        "classic program migrated"
    );
    Ok(insns)
}

/// Jump emitted before its target's position is known
struct Fixup {
    at: usize,
    pc: usize,
    target: usize,
}

struct Converter {
    out: Vec<Insn>,
    addrs: Vec<usize>,
    fixups: Vec<Fixup>,
}

fn scratch_off(k: u32) -> i16 {
    -((k * 4 + 4) as i16)
}

impl Converter {
    fn new(flen: usize) -> Self {
        Self {
            out: Vec::with_capacity(flen * 2 + 3),
            addrs: Vec::with_capacity(flen + 1),
            fixups: Vec::new(),
        }
    }

    fn emit(&mut self, insn: Insn) {
        self.out.push(insn);
    }

    fn emit_jump(&mut self, insn: Insn, pc: usize, target: usize) {
        self.fixups.push(Fixup {
            at: self.out.len(),
            pc,
            target,
        });
        self.out.push(insn);
    }

    fn convert(mut self, filter: &[SockFilter]) -> Result<Vec<Insn>, MigrateError> {
        if needs_clear_a(&filter[0]) {
            self.emit(Insn::alu32_reg(alu::XOR, Reg::A, Reg::A));
        }
        self.emit(Insn::alu32_reg(alu::XOR, Reg::X, Reg::X));
        self.emit(Insn::mov64_reg(Reg::CTX, Reg::ARG1));

        for (pc, fp) in filter.iter().enumerate() {
            self.addrs.push(self.out.len());
            self.convert_one(pc, fp);
        }
        self.addrs.push(self.out.len());

        for fixup in &self.fixups {
            let rel = self.addrs[fixup.target] as i64 - fixup.at as i64 - 1;
            self.out[fixup.at].off =
                i16::try_from(rel).map_err(|_| MigrateError::OffsetOverflow { pc: fixup.pc })?;
        }
        Ok(self.out)
    }

    fn convert_one(&mut self, pc: usize, fp: &SockFilter) {
        if fp.code & BPF_ANC != 0 {
            self.convert_ancillary(u32::from(fp.code & !BPF_ANC));
            return;
        }

        let c = fp.code as u8;
        let k = fp.k as i32;
        match class::of(c) {
            class::ALU => {
                let op = alu::of(c);
                if op == alu::NEG {
                    self.emit(Insn::alu32_imm(alu::NEG, Reg::A, 0));
                } else if src::of(c) == src::X {
                    if op == alu::DIV || op == alu::MOD {
                        // X == 0 ends the program with 0
                        self.emit(Insn::mov32_reg(Reg::X, Reg::X));
                        self.emit(Insn::jmp_imm(jmp::JNE, Reg::X, 0, 2));
                        self.emit(Insn::alu32_reg(alu::XOR, Reg::A, Reg::A));
                        self.emit(Insn::exit());
                    }
                    self.emit(Insn::alu32_reg(op, Reg::A, Reg::X));
                } else {
                    self.emit(Insn::alu32_imm(op, Reg::A, k));
                }
            }

            class::JMP => self.convert_jump(pc, fp),

            class::RET => {
                if fp.code == RET_K {
                    self.emit(Insn::mov32_imm(Reg::R0, k));
                }
                self.emit(Insn::exit());
            }

            class::MISC => {
                if misc::of(fp.code) == u16::from(misc::TAX) {
                    self.emit(Insn::mov64_reg(Reg::X, Reg::A));
                } else {
                    self.emit(Insn::mov64_reg(Reg::A, Reg::X));
                }
            }

            class::ST | class::STX => {
                let from = if class::of(c) == class::ST { Reg::A } else { Reg::X };
                self.emit(Insn::stx_mem(size::W, Reg::FP, from, scratch_off(fp.k)));
            }

            cls => {
                let dst = if cls == class::LD { Reg::A } else { Reg::X };
                match mode::of(c) {
                    mode::ABS => self.emit(Insn::ld_abs(size::of(c), k)),
                    mode::IND => self.emit(Insn::ld_ind(size::of(c), Reg::X, k)),
                    mode::MEM => self.emit(Insn::ldx_mem(size::W, dst, Reg::FP, scratch_off(fp.k))),
                    mode::LEN => self.emit(Insn::ldx_mem(size::W, dst, Reg::CTX, skb::LEN as i16)),
                    mode::MSH => {
                        self.emit(Insn::mov64_reg(Reg::TMP, Reg::A));
                        self.emit(Insn::ld_abs(size::B, k));
                        self.emit(Insn::alu32_imm(alu::AND, Reg::A, 0xf));
                        self.emit(Insn::alu32_imm(alu::LSH, Reg::A, 2));
                        self.emit(Insn::mov64_reg(Reg::X, Reg::A));
                        self.emit(Insn::mov64_reg(Reg::A, Reg::TMP));
                    }
                    _ => self.emit(Insn::mov32_imm(dst, k)),
                }
            }
        }
    }

    fn convert_jump(&mut self, pc: usize, fp: &SockFilter) {
        let c = fp.code as u8;
        if fp.code == JA {
            self.emit_jump(Insn::ja(0), pc, pc + 1 + fp.k as usize);
            return;
        }

        let op = jmp::of(c);
        let jt = pc + 1 + usize::from(fp.jt);
        let jf = pc + 1 + usize::from(fp.jf);

        // Immediates are sign extended; compare negative ones through TMP
        let cmp = |op: u8, this: &mut Self| -> Insn {
            if src::of(c) == src::X {
                Insn::jmp_reg(op, Reg::A, Reg::X, 0)
            } else if (fp.k as i32) < 0 {
                this.emit(Insn::mov32_imm(Reg::TMP, fp.k as i32));
                Insn::jmp_reg(op, Reg::A, Reg::TMP, 0)
            } else {
                Insn::jmp_imm(op, Reg::A, fp.k as i32, 0)
            }
        };

        if fp.jf == 0 {
            let insn = cmp(op, self);
            self.emit_jump(insn, pc, jt);
            return;
        }

        let inverse = match op {
            jmp::JEQ => Some(jmp::JNE),
            jmp::JGT => Some(jmp::JLE),
            jmp::JGE => Some(jmp::JLT),
            _ => None,
        };
        match inverse {
            Some(inv) if fp.jt == 0 => {
                let insn = cmp(inv, self);
                self.emit_jump(insn, pc, jf);
            }
            _ => {
                let insn = cmp(op, self);
                self.emit_jump(insn, pc, jt);
                self.emit_jump(Insn::ja(0), pc, jf);
            }
        }
    }

    fn convert_ancillary(&mut self, kind: u32) {
        let field = |off: usize| Insn::ldx_mem(size::W, Reg::A, Reg::CTX, off as i16);
        match kind {
            ancillary::PROTOCOL | ancillary::VLAN_TPID => {
                let off = if kind == ancillary::PROTOCOL {
                    skb::PROTOCOL
                } else {
                    skb::VLAN_PROTO
                };
                self.emit(Insn::ldx_mem(size::H, Reg::A, Reg::CTX, off as i16));
                self.emit(Insn::endian(endian::FROM_BE, Reg::A, 16));
            }
            ancillary::PKTTYPE => self.emit(field(skb::PKT_TYPE)),
            ancillary::IFINDEX => self.emit(field(skb::IFINDEX)),
            ancillary::MARK => self.emit(field(skb::MARK)),
            ancillary::QUEUE => self.emit(field(skb::QUEUE_MAPPING)),
            ancillary::HATYPE => self.emit(field(skb::HATYPE)),
            ancillary::RXHASH => self.emit(field(skb::HASH)),
            ancillary::VLAN_TAG => self.emit(field(skb::VLAN_TCI)),
            ancillary::VLAN_TAG_PRESENT => self.emit(field(skb::VLAN_PRESENT)),
            ancillary::PAY_OFFSET => self.emit(field(skb::PAY_OFFSET)),
            ancillary::ALU_XOR_X => self.emit(Insn::alu32_reg(alu::XOR, Reg::A, Reg::X)),
            _ => {
                let helper = match kind {
                    ancillary::NLATTR => helper_id::SKB_GET_NLATTR,
                    ancillary::NLATTR_NEST => helper_id::SKB_GET_NLATTR_NEST,
                    ancillary::CPU => helper_id::GET_SMP_PROCESSOR_ID,
                    _ => helper_id::GET_PRANDOM_U32,
                };
                self.emit(Insn::mov64_reg(Reg::ARG1, Reg::CTX));
                self.emit(Insn::mov64_reg(Reg::ARG2, Reg::A));
                self.emit(Insn::mov64_reg(Reg::ARG3, Reg::X));
                self.emit(Insn::emit_call(helper));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_bytecode::classic::SKF_AD_OFF;

    fn stmt(code: u8, k: u32) -> SockFilter {
        SockFilter::stmt(u16::from(code), k)
    }

    fn jump(code: u8, k: u32, jt: u8, jf: u8) -> SockFilter {
        SockFilter::jump(u16::from(code), k, jt, jf)
    }

    const RET: u8 = class::RET | src::K;

    #[test]
    fn test_needs_clear_a() {
        assert!(!needs_clear_a(&stmt(RET, 0)));
        assert!(!needs_clear_a(&SockFilter::stmt(LD_W_LEN, 0)));
        assert!(needs_clear_a(&SockFilter::stmt(LD_W_ABS, 12)));
        let xor_x = SockFilter::stmt(LD_B_ABS, ancillary_k(ancillary::ALU_XOR_X));
        assert!(!needs_clear_a(&xor_x));
        let tagged = SockFilter::stmt(ancillary_code(&xor_x), xor_x.k);
        assert!(!needs_clear_a(&tagged));
        assert!(needs_clear_a(&SockFilter::stmt(LD_H_ABS, ancillary_k(ancillary::MARK))));
    }

    #[test]
    fn test_ancillary_tagging() {
        let proto = SockFilter::stmt(LD_H_ABS, SKF_AD_OFF as u32);
        assert_eq!(ancillary_code(&proto), BPF_ANC);
        let plain = SockFilter::stmt(LD_H_ABS, 12);
        assert_eq!(ancillary_code(&plain), LD_H_ABS);
        let ret = stmt(RET, ancillary_k(ancillary::MARK));
        assert_eq!(ancillary_code(&ret), ret.code);
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(check_classic(&[]), Err(MigrateError::Empty));
        assert_eq!(
            check_classic(&vec![stmt(RET, 0); MAX_CLASSIC_INSNS + 1]),
            Err(MigrateError::TooLong(MAX_CLASSIC_INSNS + 1))
        );
        assert_eq!(
            check_classic(&[stmt(0xff, 0), stmt(RET, 0)]),
            Err(MigrateError::UnknownOpcode { pc: 0, code: 0xff })
        );
        assert_eq!(
            check_classic(&[stmt(class::ALU | alu::DIV, 0), stmt(RET, 0)]),
            Err(MigrateError::DivisionByZero { pc: 0 })
        );
        assert_eq!(
            check_classic(&[stmt(class::ALU | alu::LSH, 32), stmt(RET, 0)]),
            Err(MigrateError::ShiftTooLarge { pc: 0, k: 32 })
        );
        assert_eq!(
            check_classic(&[stmt(class::ST, 16), stmt(RET, 0)]),
            Err(MigrateError::ScratchOutOfRange { pc: 0, k: 16 })
        );
        assert_eq!(
            check_classic(&[jump(class::JMP | jmp::JEQ, 0, 1, 0), stmt(RET, 0)]),
            Err(MigrateError::JumpOutOfRange { pc: 0 })
        );
        assert_eq!(
            check_classic(&[stmt(class::JMP, 1), stmt(RET, 0)]),
            Err(MigrateError::JumpOutOfRange { pc: 0 })
        );
        assert_eq!(
            check_classic(&[SockFilter::stmt(LD_W_ABS, ancillary_k(2)), stmt(RET, 0)]),
            Err(MigrateError::UnknownAncillary {
                pc: 0,
                k: ancillary_k(2)
            })
        );
        assert_eq!(
            check_classic(&[stmt(class::LD | mode::IMM, 1)]),
            Err(MigrateError::MissingReturn)
        );
    }

    #[test]
    fn test_scratch_must_be_written_on_every_path() {
        let store_on_one_path = [
            jump(class::JMP | jmp::JEQ, 0, 0, 1),
            stmt(class::ST, 3),
            SockFilter::stmt(LD_MEM, 3),
            stmt(RET, 0),
        ];
        assert_eq!(
            check_classic(&store_on_one_path),
            Err(MigrateError::UninitializedScratch { pc: 2, k: 3 })
        );

        let store_first = [
            stmt(class::ST, 3),
            jump(class::JMP | jmp::JEQ, 0, 0, 0),
            SockFilter::stmt(LDX_MEM, 3),
            stmt(RET, 0),
        ];
        assert_eq!(check_classic(&store_first), Ok(()));
    }

    #[test]
    fn test_ret_k_prologue_skips_clear() {
        let insns = migrate(&[stmt(RET, 0xffff)]).unwrap();
        assert_eq!(
            insns,
            vec![
                Insn::alu32_reg(alu::XOR, Reg::X, Reg::X),
                Insn::mov64_reg(Reg::CTX, Reg::ARG1),
                Insn::mov32_imm(Reg::R0, 0xffff),
                Insn::exit(),
            ]
        );
    }

    #[test]
    fn test_jump_forms() {
        // jt == 0: inverted condition to jf
        let insns = migrate(&[
            SockFilter::stmt(LD_H_ABS, 12),
            jump(class::JMP | jmp::JEQ, 0x800, 0, 1),
            stmt(RET, 1),
            stmt(RET, 0),
        ])
        .unwrap();
        // XOR A, XOR X, MOV CTX, LD_ABS, JNE, MOV, EXIT, MOV, EXIT
        assert_eq!(insns[4], Insn::jmp_imm(jmp::JNE, Reg::A, 0x800, 2));

        // both targets non-zero: conditional plus JA
        let insns = migrate(&[
            jump(class::JMP | jmp::JSET, 1, 1, 2),
            stmt(RET, 1),
            stmt(RET, 2),
            stmt(RET, 3),
        ])
        .unwrap();
        assert_eq!(insns[3], Insn::jmp_imm(jmp::JSET, Reg::A, 1, 3));
        assert_eq!(insns[4], Insn::ja(4));

        // negative immediate goes through TMP
        let insns = migrate(&[
            jump(class::JMP | jmp::JGT, 0xffff_fff0, 0, 0),
            stmt(RET, 0),
        ])
        .unwrap();
        assert_eq!(insns[3], Insn::mov32_imm(Reg::TMP, -16));
        assert_eq!(insns[4], Insn::jmp_reg(jmp::JGT, Reg::A, Reg::TMP, 0));
    }

    #[test]
    fn test_div_by_x_guard() {
        let insns = migrate(&[stmt(class::ALU | alu::DIV | src::X, 0), stmt(class::RET | src::A, 0)]).unwrap();
        assert_eq!(
            &insns[3..8],
            &[
                Insn::mov32_reg(Reg::X, Reg::X),
                Insn::jmp_imm(jmp::JNE, Reg::X, 0, 2),
                Insn::alu32_reg(alu::XOR, Reg::A, Reg::A),
                Insn::exit(),
                Insn::alu32_reg(alu::DIV, Reg::A, Reg::X),
            ]
        );
    }
}
