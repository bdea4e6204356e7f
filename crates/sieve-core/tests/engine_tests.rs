//! Loading, running and destroying native programs through the engine

use sieve_core::bytecode::opcode::{alu, jmp, size};
use sieve_core::bytecode::{Insn, ProgType, Reg, decode_program, encode_program};
use sieve_core::context::skb;
use sieve_core::{
    Caps, Engine, EngineConfig, HelperRegistry, JitPolicy, LoadError, Program, ProgramFlags, SkBuffContext,
};
use std::sync::Arc;

fn both() -> [Engine; 2] {
    [
        Engine::from_parts(EngineConfig::default(), None, HelperRegistry::with_builtins()),
        Engine::new(EngineConfig::default()),
    ]
}

fn build(insns: &[Insn]) -> Program {
    Program::build(insns, ProgType::SchedCls, ProgramFlags::default()).unwrap()
}

#[test]
fn test_mov_add_exit_is_eight() {
    for engine in both() {
        let prog = engine
            .load(
                build(&[
                    Insn::mov64_imm(Reg::R0, 5),
                    Insn::alu64_imm(alu::ADD, Reg::R0, 3),
                    Insn::exit(),
                ]),
                Caps::ADMIN,
            )
            .unwrap();
        let mut worker = engine.worker();
        assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 8);
    }
}

#[test]
fn test_wide_load_spans_two_slots() {
    let [lo, hi] = Insn::ld_imm64(Reg::R0, 0x1122_3344_5566_7788);
    assert_eq!(hi.code, 0);
    let insns = [lo, hi, Insn::alu64_imm(alu::RSH, Reg::R0, 32), Insn::exit()];
    let bytes = encode_program(&insns);
    assert_eq!(bytes.len(), 32);
    assert_eq!(decode_program(&bytes).unwrap(), insns);

    for engine in both() {
        let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
        assert_eq!(prog.insn_count(), 4);
        let mut worker = engine.worker();
        assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 0x1122_3344);
    }
}

#[test]
fn test_stack_is_private_to_each_run() {
    // return the old slot value, then overwrite it
    let insns = [
        Insn::ldx_mem(size::DW, Reg::R0, Reg::FP, -8),
        Insn::st_mem(size::DW, Reg::FP, -8, 77),
        Insn::exit(),
    ];
    for engine in both() {
        let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
        let mut worker = engine.worker();
        let mut ctx = SkBuffContext::new(vec![0; 20]);
        assert_eq!(worker.run(&prog, &mut ctx), 0);
        assert_eq!(worker.run(&prog, &mut ctx), 0);
    }
}

#[test]
fn test_function_calls_restore_callee_saved() {
    let insns = [
        Insn::mov64_imm(Reg::R6, 40),
        Insn::mov64_imm(Reg::R1, 2),
        Insn::call_rel(3),
        Insn::alu64_reg(alu::ADD, Reg::R0, Reg::R6),
        Insn::exit(),
        Insn::exit(),
        // callee: R0 = R1 * 10, clobbers R6
        Insn::mov64_reg(Reg::R0, Reg::R1),
        Insn::alu64_imm(alu::MUL, Reg::R0, 10),
        Insn::mov64_imm(Reg::R6, 1000),
        Insn::exit(),
    ];
    for engine in both() {
        let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
        let mut worker = engine.worker();
        assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 60);
    }
}

#[test]
fn test_unbounded_recursion_faults_to_zero() {
    let insns = [
        Insn::mov64_imm(Reg::R0, 1),
        Insn::call_rel(-2),
        Insn::exit(),
    ];
    for engine in both() {
        let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
        let mut worker = engine.worker();
        assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 0);
    }
}

#[test]
fn test_unknown_helper_faults_to_zero() {
    let insns = [
        Insn::mov64_imm(Reg::R0, 1),
        Insn::emit_call(0x4242),
        Insn::exit(),
    ];
    for engine in both() {
        let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
        let mut worker = engine.worker();
        assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 0);
    }
}

#[test]
fn test_custom_helper() {
    fn triple(_ctx: &mut sieve_core::HelperCtx<'_>, args: [u64; 5]) -> u64 {
        args[0] * 3
    }
    let mut helpers = HelperRegistry::with_builtins();
    helpers.register(sieve_core::bytecode::helper_id::FIRST_CUSTOM, triple);
    let engine = Engine::from_parts(EngineConfig::default(), None, helpers);

    let insns = [
        Insn::mov64_imm(Reg::R1, 14),
        Insn::emit_call(sieve_core::bytecode::helper_id::FIRST_CUSTOM),
        Insn::exit(),
    ];
    let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();
    let mut worker = engine.worker();
    assert_eq!(worker.run(&prog, &mut SkBuffContext::new(vec![0; 20])), 42);
}

#[test]
fn test_scratch_isolation_between_invocations() {
    let cb = skb::CB as i16;
    // return the first scratch word, then leave garbage behind
    let insns = [
        Insn::ldx_mem(size::W, Reg::R0, Reg::R1, cb),
        Insn::st_mem(size::W, Reg::R1, cb, 0x5a5a),
        Insn::exit(),
    ];
    let isolated = Program::build(
        &insns,
        ProgType::SchedCls,
        ProgramFlags {
            cb_access: true,
            ..ProgramFlags::default()
        },
    )
    .unwrap();

    for engine in both() {
        let isolated = engine.load(isolated_clone(&isolated), Caps::ADMIN).unwrap();
        let mut worker = engine.worker();
        let mut ctx = SkBuffContext::new(vec![0; 20]);
        ctx.cb_mut()[..4].copy_from_slice(&0x1234u32.to_le_bytes());
        assert_eq!(worker.run(&isolated, &mut ctx), 0);
        assert_eq!(worker.run(&isolated, &mut ctx), 0);
        assert_eq!(&ctx.cb()[..4], &0x1234u32.to_le_bytes());
    }
}

fn isolated_clone(prog: &Program) -> Program {
    Program::build(prog.insns(), prog.prog_type(), prog.flags()).unwrap()
}

#[test]
fn test_jit_always_on_without_generator_fails() {
    let config = EngineConfig {
        policy: JitPolicy {
            jit_always_on: true,
            ..JitPolicy::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::from_parts(config, None, HelperRegistry::with_builtins());
    let err = engine.load(build(&[Insn::exit()]), Caps::ADMIN).unwrap_err();
    assert!(matches!(err, LoadError::JitRequired));

    let engine = Engine::new(config);
    assert!(engine.load(build(&[Insn::exit()]), Caps::ADMIN).unwrap().is_jited());
}

#[test]
fn test_concurrent_runs_and_stats() {
    let config = EngineConfig {
        stats_enabled: true,
        stats_slots: 4,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    let insns = [
        Insn::ldx_mem(size::W, Reg::R0, Reg::R1, skb::LEN as i16),
        Insn::jmp_imm(jmp::JGT, Reg::R0, 100, 1),
        Insn::exit(),
        Insn::mov64_imm(Reg::R0, 0),
        Insn::exit(),
    ];
    let prog = engine.load(build(&insns), Caps::ADMIN).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let prog = Arc::clone(&prog);
            std::thread::spawn(move || {
                let mut worker = engine.worker();
                let mut ctx = SkBuffContext::new(vec![0; 64]);
                (0..500).map(|_| worker.run(&prog, &mut ctx)).sum::<u32>()
            })
        })
        .collect();
    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total, 4 * 500 * 64);
    assert_eq!(prog.stats().cnt, 2000);
    assert!(engine.destroy(prog));
}

#[test]
fn test_stats_toggle() {
    let engine = Engine::new(EngineConfig::default());
    let prog = engine.load(build(&[Insn::exit()]), Caps::ADMIN).unwrap();
    let mut worker = engine.worker();
    let mut ctx = SkBuffContext::new(vec![0; 20]);

    worker.run(&prog, &mut ctx);
    assert_eq!(prog.stats().cnt, 0);

    engine.set_stats_enabled(true);
    worker.run(&prog, &mut ctx);
    worker.run(&prog, &mut ctx);
    assert_eq!(prog.stats().cnt, 2);
}
