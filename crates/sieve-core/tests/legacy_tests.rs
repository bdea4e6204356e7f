//! Classic filters migrated and run end to end

use sieve_core::bytecode::SockFilter;
use sieve_core::bytecode::classic::{SKF_NET_OFF, ancillary, ancillary_k};
use sieve_core::bytecode::opcode::{alu, class, jmp, misc, mode, size, src};
use sieve_core::{
    Caps, Engine, EngineConfig, Harden, HelperRegistry, JitPolicy, LoadError, MigrateError, ProgramRef,
    SkBuffContext,
};

fn stmt(code: u8, k: u32) -> SockFilter {
    SockFilter::stmt(u16::from(code), k)
}

fn jump(op: u8, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter::jump(u16::from(class::JMP | op | src::K), k, jt, jf)
}

fn ret_k(k: u32) -> SockFilter {
    stmt(class::RET | src::K, k)
}

fn ret_a() -> SockFilter {
    stmt(class::RET | src::A, 0)
}

fn ld_abs(sz: u8, k: u32) -> SockFilter {
    stmt(class::LD | sz | mode::ABS, k)
}

/// `ip and tcp`
fn ipv4_tcp() -> Vec<SockFilter> {
    vec![
        ld_abs(size::H, 12),
        jump(jmp::JEQ, 0x0800, 0, 3),
        ld_abs(size::B, 23),
        jump(jmp::JEQ, 6, 0, 1),
        ret_k(0xffff),
        ret_k(0),
    ]
}

fn frame(ethertype: u16, ip_proto: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 60];
    pkt[12..14].copy_from_slice(&ethertype.to_be_bytes());
    pkt[14] = 0x45;
    pkt[23] = ip_proto;
    pkt
}

fn engines() -> Vec<Engine> {
    let hardened = EngineConfig {
        policy: JitPolicy {
            harden: Harden::Always,
            ..JitPolicy::default()
        },
        ..EngineConfig::default()
    };
    vec![
        Engine::from_parts(EngineConfig::default(), None, HelperRegistry::with_builtins()),
        Engine::new(EngineConfig::default()),
        Engine::new(hardened),
    ]
}

fn run_all(filter: &[SockFilter], ctx: &SkBuffContext) -> Vec<u32> {
    engines()
        .iter()
        .map(|engine| {
            let prog: ProgramRef = engine.load_classic(filter, false, Caps::UNPRIVILEGED).unwrap();
            let mut worker = engine.worker();
            worker.run(&prog, &mut ctx.clone())
        })
        .collect()
}

#[test]
fn test_ipv4_tcp_filter() {
    let accept = SkBuffContext::new(frame(0x0800, 6));
    let udp = SkBuffContext::new(frame(0x0800, 17));
    let ipv6 = SkBuffContext::new(frame(0x86dd, 6));

    assert_eq!(run_all(&ipv4_tcp(), &accept), vec![0xffff; 3]);
    assert_eq!(run_all(&ipv4_tcp(), &udp), vec![0; 3]);
    assert_eq!(run_all(&ipv4_tcp(), &ipv6), vec![0; 3]);
}

#[test]
fn test_short_packet_returns_zero() {
    let runt = SkBuffContext::new(vec![0u8; 10]);
    assert_eq!(run_all(&ipv4_tcp(), &runt), vec![0; 3]);
}

#[test]
fn test_orig_prog_kept_on_request() {
    let engine = Engine::new(EngineConfig::default());
    let kept = engine.load_classic(&ipv4_tcp(), true, Caps::ADMIN).unwrap();
    assert_eq!(kept.orig_prog(), Some(&ipv4_tcp()[..]));
    assert!(kept.was_legacy());

    let dropped = engine.load_classic(&ipv4_tcp(), false, Caps::ADMIN).unwrap();
    assert!(dropped.orig_prog().is_none());
    assert_eq!(kept.tag(), dropped.tag());
}

#[test]
fn test_ancillary_loads() {
    let ctx = SkBuffContext::new(frame(0x0800, 6))
        .with_protocol(0x86dd)
        .with_mark(0xabc)
        .with_ifindex(7)
        .with_vlan(0x123, 0x8100);

    let load = |kind| vec![ld_abs(size::W, ancillary_k(kind)), ret_a()];
    assert_eq!(run_all(&load(ancillary::PROTOCOL), &ctx), vec![0x86dd; 3]);
    assert_eq!(run_all(&load(ancillary::MARK), &ctx), vec![0xabc; 3]);
    assert_eq!(run_all(&load(ancillary::IFINDEX), &ctx), vec![7; 3]);
    assert_eq!(run_all(&load(ancillary::VLAN_TAG), &ctx), vec![0x123; 3]);
    assert_eq!(run_all(&load(ancillary::VLAN_TAG_PRESENT), &ctx), vec![1; 3]);
    assert_eq!(run_all(&load(ancillary::VLAN_TPID), &ctx), vec![0x8100; 3]);
}

#[test]
fn test_cpu_ancillary_reports_worker() {
    let engine = Engine::new(EngineConfig::default());
    let prog = engine
        .load_classic(&[ld_abs(size::W, ancillary_k(ancillary::CPU)), ret_a()], false, Caps::ADMIN)
        .unwrap();
    let _first = engine.worker();
    let mut second = engine.worker();
    let mut ctx = SkBuffContext::new(vec![0; 20]);
    assert_eq!(second.run(&prog, &mut ctx), second.id());
    assert_eq!(second.id(), 1);
}

#[test]
fn test_header_length_and_scratch() {
    let ctx = SkBuffContext::new(frame(0x0800, 6));
    let filter = [
        // X = 4 * (pkt[14] & 0xf)
        stmt(class::LDX | size::B | mode::MSH, 14),
        stmt(class::MISC | misc::TXA, 0),
        stmt(class::ST, 2),
        stmt(class::LD | mode::IMM, 5),
        stmt(class::LDX | mode::MEM, 2),
        stmt(class::ALU | alu::ADD | src::X, 0),
        ret_a(),
    ];
    assert_eq!(run_all(&filter, &ctx), vec![25; 3]);
}

#[test]
fn test_length_and_network_relative_loads() {
    let ctx = SkBuffContext::new(frame(0x0800, 17));
    let len = [stmt(class::LD | size::W | mode::LEN, 0), ret_a()];
    assert_eq!(run_all(&len, &ctx), vec![60; 3]);

    let proto = [ld_abs(size::B, (SKF_NET_OFF + 9) as u32), ret_a()];
    assert_eq!(run_all(&proto, &ctx), vec![17; 3]);
}

#[test]
fn test_division_by_zero_index() {
    let ctx = SkBuffContext::new(vec![0; 20]);
    let filter = [
        stmt(class::LD | mode::IMM, 10),
        stmt(class::LDX | mode::IMM, 0),
        stmt(class::ALU | alu::DIV | src::X, 0),
        ret_k(99),
    ];
    assert_eq!(run_all(&filter, &ctx), vec![0; 3]);

    let filter = [
        stmt(class::LD | mode::IMM, 10),
        stmt(class::LDX | mode::IMM, 3),
        stmt(class::ALU | alu::DIV | src::X, 0),
        ret_a(),
    ];
    assert_eq!(run_all(&filter, &ctx), vec![3; 3]);
}

#[test]
fn test_negative_immediate_compare() {
    let ctx = SkBuffContext::new(vec![0; 20]);
    let filter = [
        stmt(class::LD | mode::IMM, 0xffff_fff0),
        jump(jmp::JGE, 0xffff_ffe0, 0, 1),
        ret_k(1),
        ret_k(2),
    ];
    assert_eq!(run_all(&filter, &ctx), vec![1; 3]);
}

#[test]
fn test_rejected_programs() {
    let engine = Engine::new(EngineConfig::default());
    let err = engine
        .load_classic(&[stmt(class::LD | mode::MEM, 0), ret_a()], false, Caps::ADMIN)
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::Migrate(MigrateError::UninitializedScratch { pc: 0, k: 0 })
    ));
    assert!(matches!(
        engine.load_classic(&[], false, Caps::ADMIN),
        Err(LoadError::Migrate(MigrateError::Empty))
    ));
}
