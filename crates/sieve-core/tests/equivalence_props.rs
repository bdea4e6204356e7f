//! Interpreter, compiled and blinded-compiled execution agree on random
//! programs.

use proptest::prelude::*;
use sieve_core::bytecode::opcode::{alu, jmp};
use sieve_core::bytecode::{BytecodeError, Insn, ProgType, Reg, encode_program};
use sieve_core::{
    Caps, Engine, EngineConfig, Harden, HelperRegistry, JitPolicy, LoadError, Program, ProgramFlags, SkBuffContext,
};

const ALU_OPS: [u8; 13] = [
    alu::ADD,
    alu::SUB,
    alu::MUL,
    alu::DIV,
    alu::OR,
    alu::AND,
    alu::LSH,
    alu::RSH,
    alu::NEG,
    alu::MOD,
    alu::XOR,
    alu::MOV,
    alu::ARSH,
];

const JMP_OPS: [u8; 11] = [
    jmp::JEQ,
    jmp::JGT,
    jmp::JGE,
    jmp::JSET,
    jmp::JNE,
    jmp::JSGT,
    jmp::JSGE,
    jmp::JLT,
    jmp::JLE,
    jmp::JSLT,
    jmp::JSLE,
];

#[derive(Debug, Clone)]
enum Unit {
    Alu { wide: bool, reg: bool, op: usize, dst: u8, src: u8, imm: i32 },
    Jump { wide: bool, reg: bool, op: usize, dst: u8, src: u8, imm: i32, skip: usize },
    Wide { dst: u8, value: u64 },
}

impl Unit {
    fn slots(&self) -> usize {
        match self {
            Unit::Wide { .. } => 2,
            _ => 1,
        }
    }
}

fn unit() -> impl Strategy<Value = Unit> {
    let reg = 0u8..10;
    prop_oneof![
        4 => (any::<bool>(), any::<bool>(), 0..ALU_OPS.len(), reg.clone(), reg.clone(), any::<i32>())
            .prop_map(|(wide, reg, op, dst, src, imm)| Unit::Alu { wide, reg, op, dst, src, imm }),
        2 => (any::<bool>(), any::<bool>(), 0..JMP_OPS.len(), reg.clone(), reg.clone(), -4i32..4, 0usize..6)
            .prop_map(|(wide, reg, op, dst, src, imm, skip)| Unit::Jump { wide, reg, op, dst, src, imm, skip }),
        1 => (reg, any::<u64>()).prop_map(|(dst, value)| Unit::Wide { dst, value }),
    ]
}

fn lower(units: &[Unit]) -> Vec<Insn> {
    let mut insns = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        match *unit {
            Unit::Alu { wide, reg, op, dst, src, imm } => {
                let op = ALU_OPS[op];
                insns.push(match (wide, reg) {
                    (true, true) => Insn::alu64_reg(op, Reg(dst), Reg(src)),
                    (true, false) => Insn::alu64_imm(op, Reg(dst), imm),
                    (false, true) => Insn::alu32_reg(op, Reg(dst), Reg(src)),
                    (false, false) => Insn::alu32_imm(op, Reg(dst), imm),
                });
            }
            Unit::Jump { wide, reg, op, dst, src, imm, skip } => {
                let rest = &units[i + 1..];
                let skip = skip.min(rest.len());
                let off = rest[..skip].iter().map(Unit::slots).sum::<usize>() as i16;
                let op = JMP_OPS[op];
                insns.push(match (wide, reg) {
                    (true, true) => Insn::jmp_reg(op, Reg(dst), Reg(src), off),
                    (true, false) => Insn::jmp_imm(op, Reg(dst), imm, off),
                    (false, true) => Insn::jmp32_reg(op, Reg(dst), Reg(src), off),
                    (false, false) => Insn::jmp32_imm(op, Reg(dst), imm, off),
                });
            }
            Unit::Wide { dst, value } => insns.extend(Insn::ld_imm64(Reg(dst), value)),
        }
    }
    // fold the high half of R0 into the 32-bit result
    insns.push(Insn::mov64_reg(Reg::R1, Reg::R0));
    insns.push(Insn::alu64_imm(alu::RSH, Reg::R1, 32));
    insns.push(Insn::alu64_reg(alu::XOR, Reg::R0, Reg::R1));
    insns.push(Insn::exit());
    insns
}

fn run_with(engine: &Engine, insns: &[Insn], packet: &[u8]) -> (u32, bool, bool) {
    let prog = Program::build(insns, ProgType::SocketFilter, ProgramFlags::default()).unwrap();
    let prog = engine.load(prog, Caps::UNPRIVILEGED).unwrap();
    let mut worker = engine.worker();
    let mut ctx = SkBuffContext::new(packet.to_vec());
    let ret = worker.run(&prog, &mut ctx);
    (ret, prog.is_jited(), prog.flags().blinded)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn compiled_matches_interpreter(units in prop::collection::vec(unit(), 1..40), packet in prop::collection::vec(any::<u8>(), 0..64)) {
        let insns = lower(&units);

        let interp = Engine::from_parts(EngineConfig::default(), None, HelperRegistry::with_builtins());
        let compiled = Engine::new(EngineConfig::default());
        let hardened = Engine::new(EngineConfig {
            policy: JitPolicy { harden: Harden::Always, ..JitPolicy::default() },
            ..EngineConfig::default()
        });

        let (expected, jited, _) = run_with(&interp, &insns, &packet);
        prop_assert!(!jited);

        let (ret, jited, blinded) = run_with(&compiled, &insns, &packet);
        prop_assert!(jited && !blinded);
        prop_assert_eq!(ret, expected);

        let (ret, jited, blinded) = run_with(&hardened, &insns, &packet);
        prop_assert!(jited && blinded);
        prop_assert_eq!(ret, expected);
    }

    #[test]
    fn blinding_twice_is_a_no_op(units in prop::collection::vec(unit(), 1..20)) {
        let insns = lower(&units);
        let mut prog = Program::build(&insns, ProgType::SocketFilter, ProgramFlags::default()).unwrap();
        prop_assert_eq!(prog.blind_constants(), Ok(true));
        let once = prog.insns().to_vec();
        prop_assert_eq!(prog.blind_constants(), Ok(false));
        prop_assert_eq!(prog.insns(), &once[..]);
    }

    #[test]
    fn reserved_registers_never_load(
        units in prop::collection::vec(unit(), 1..20),
        at in any::<prop::sample::Index>(),
        reg in 11u8..16,
        as_src in any::<bool>(),
    ) {
        let mut insns = lower(&units);
        let pc = at.index(insns.len());
        if as_src {
            insns[pc].set_src(Reg(reg));
        } else {
            insns[pc].set_dst(Reg(reg));
        }
        let expected = BytecodeError::InvalidRegister { pc, reg };

        let built = Program::build(&insns, ProgType::SocketFilter, ProgramFlags::default());
        prop_assert!(matches!(built, Err(LoadError::Bytecode(ref e)) if *e == expected));
        let decoded = Program::from_bytes(&encode_program(&insns), ProgType::SocketFilter, ProgramFlags::default());
        prop_assert!(matches!(decoded, Err(LoadError::Bytecode(ref e)) if *e == expected));
    }
}
