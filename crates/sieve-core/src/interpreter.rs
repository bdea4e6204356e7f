//! Reference interpreter
//!
//! Decodes and executes one instruction slot at a time. Every program can
//! run here; compiled code must produce the same results.

use sieve_bytecode::Insn;
use sieve_bytecode::register::MAX_EXT_REG;
use sieve_bytecode::opcode::{alu, class, jmp, mode, size, src};

use crate::error::Fault;
use crate::vm::{self, Vm};

/// Run `insns` to completion and return R0
pub fn run(insns: &[Insn], vm: &mut Vm<'_>) -> Result<u64, Fault> {
    let mut pc = 0usize;
    loop {
        let insn = *insns.get(pc).ok_or(Fault::PcOutOfRange { pc: pc as i64 })?;
        let code = insn.code;
        let dst = insn.dst().index() as usize;
        let src_reg = insn.src().index() as usize;
        let invalid = Fault::InvalidOpcode { pc, code };
        if dst >= MAX_EXT_REG || src_reg >= MAX_EXT_REG {
            return Err(invalid);
        }

        match insn.class() {
            cls @ (class::ALU | class::ALU64) => {
                let op = alu::of(code);
                let value = if op == alu::END {
                    vm::byte_swap(src::of(code), insn.imm, vm.regs[dst])
                } else {
                    let operand = if src::of(code) == src::X {
                        vm.regs[src_reg]
                    } else {
                        insn.imm as i64 as u64
                    };
                    if cls == class::ALU64 {
                        vm::alu64(op, vm.regs[dst], operand)
                    } else {
                        vm::alu32(op, vm.regs[dst] as u32, operand as u32)
                    }
                };
                vm.regs[dst] = value.ok_or(invalid)?;
                pc += 1;
            }

            class::LD => {
                let width = size::to_bytes(size::of(code)).ok_or(invalid.clone())?;
                match mode::of(code) {
                    mode::IMM if width == 8 => {
                        let hi = insns.get(pc + 1).ok_or(invalid)?;
                        vm.regs[dst] = u64::from(insn.imm as u32) | (u64::from(hi.imm as u32) << 32);
                        pc += 2;
                    }
                    mode::ABS | mode::IND if width <= 4 => {
                        let off = if mode::of(code) == mode::ABS {
                            insn.imm
                        } else {
                            vm::ind_offset(vm.regs[src_reg], insn.imm)
                        };
                        match vm.load_packet(off, width) {
                            Some(value) => vm.regs[0] = value,
                            None => return Ok(0),
                        }
                        pc += 1;
                    }
                    _ => return Err(invalid),
                }
            }

            class::LDX => {
                let width = size::to_bytes(size::of(code)).ok_or(invalid.clone())?;
                if mode::of(code) != mode::MEM {
                    return Err(invalid);
                }
                let addr = vm.regs[src_reg].wrapping_add(insn.off as i64 as u64);
                vm.regs[dst] = vm.load(pc, addr, width)?;
                pc += 1;
            }

            class::ST | class::STX => {
                let width = size::to_bytes(size::of(code)).ok_or(invalid.clone())?;
                let addr = vm.regs[dst].wrapping_add(insn.off as i64 as u64);
                let value = if insn.class() == class::ST {
                    insn.imm as i64 as u64
                } else {
                    vm.regs[src_reg]
                };
                match mode::of(code) {
                    mode::MEM => vm.store(pc, addr, width, value)?,
                    mode::XADD if insn.class() == class::STX && width >= 4 => {
                        vm.xadd(pc, addr, width, value)?
                    }
                    _ => return Err(invalid),
                }
                pc += 1;
            }

            cls @ (class::JMP | class::JMP32) => {
                let op = jmp::of(code);
                match op {
                    jmp::JA if cls == class::JMP => {
                        pc = vm::branch_target(pc, i64::from(insn.off))?;
                    }
                    jmp::CALL if cls == class::JMP => {
                        if insn.is_pseudo_call() {
                            vm.push_call(pc, pc + 1)?;
                            pc = vm::branch_target(pc, i64::from(insn.imm))?;
                        } else {
                            vm.call_helper(pc, insn.imm)?;
                            pc += 1;
                        }
                    }
                    jmp::EXIT if cls == class::JMP => match vm.pop_return() {
                        Some(ret) => pc = ret,
                        None => return Ok(vm.regs[0]),
                    },
                    _ => {
                        let operand = if src::of(code) == src::X {
                            vm.regs[src_reg]
                        } else {
                            insn.imm as i64 as u64
                        };
                        let taken = if cls == class::JMP {
                            vm::jmp64(op, vm.regs[dst], operand)
                        } else {
                            vm::jmp32(op, vm.regs[dst], operand)
                        };
                        pc = if taken.ok_or(invalid)? {
                            vm::branch_target(pc, i64::from(insn.off))?
                        } else {
                            pc + 1
                        };
                    }
                }
            }

            _ => return Err(invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProgramContext, SkBuffContext};
    use crate::helpers::HelperRegistry;
    use crate::worker::WorkerState;
    use sieve_bytecode::Reg;

    #[test]
    fn test_register_outside_file_faults() {
        let helpers = HelperRegistry::with_builtins();
        let mut state = WorkerState::new(0);
        let mut ctx = SkBuffContext::new(vec![0; 20]);
        let mut vm = Vm::new(ctx.regions(), &mut state, &helpers, &[]);

        let mut wild = Insn::mov64_imm(Reg::R0, 1);
        wild.set_dst(Reg(12));
        assert!(matches!(
            run(&[wild, Insn::exit()], &mut vm),
            Err(Fault::InvalidOpcode { pc: 0, .. })
        ));
        assert_eq!(run(&[Insn::mov64_imm(Reg::R0, 3), Insn::exit()], &mut vm).ok(), Some(3));
    }
}
