//! Map-based forwarding flushes in the order packets were queued

use parking_lot::Mutex;
use sieve_core::bytecode::helper_id;
use sieve_core::bytecode::{Insn, ProgType, Reg};
use sieve_core::{
    Caps, Engine, EngineConfig, ForwardMap, MapRef, Program, ProgramFlags, ProgramRef, RedirectError,
    RedirectTarget, XdpAction, XdpContext,
};
use std::sync::Arc;

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

struct DevMap {
    name: &'static str,
    log: Arc<Log>,
    slots: u32,
}

impl ForwardMap for DevMap {
    fn enqueue(&self, key: u32, packet: &[u8]) -> Result<(), RedirectError> {
        if key >= self.slots {
            return Err(RedirectError::NoEntry(key));
        }
        self.log.0.lock().push(format!("{}:enqueue:{key}:{}", self.name, packet.len()));
        Ok(())
    }

    fn flush(&self) {
        self.log.0.lock().push(format!("{}:flush", self.name));
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// `return redirect_map(maps[fd], key, 0)`
fn forward(engine: &Engine, maps: &[MapRef], fd: i32, key: i32) -> ProgramRef {
    let [lo, hi] = Insn::ld_map_fd(Reg::R1, fd);
    let insns = [
        lo,
        hi,
        Insn::mov64_imm(Reg::R2, key),
        Insn::mov64_imm(Reg::R3, 0),
        Insn::emit_call(helper_id::REDIRECT_MAP),
        Insn::exit(),
    ];
    let prog = Program::build(&insns, ProgType::Xdp, ProgramFlags::default())
        .unwrap()
        .with_used_maps(maps.to_vec());
    engine.load(prog, Caps::ADMIN).unwrap()
}

#[test]
fn test_switching_maps_flushes_previous() {
    let log = Arc::new(Log::default());
    let a: MapRef = Arc::new(DevMap {
        name: "a",
        log: Arc::clone(&log),
        slots: 4,
    });
    let b: MapRef = Arc::new(DevMap {
        name: "b",
        log: Arc::clone(&log),
        slots: 4,
    });
    let maps = vec![a, b];

    let engine = Engine::new(EngineConfig::default());
    let to_a = forward(&engine, &maps, 0, 1);
    let to_b = forward(&engine, &maps, 1, 2);
    let mut worker = engine.worker();

    for prog in [&to_a, &to_a, &to_b] {
        let mut ctx = XdpContext::new(vec![0; 64], 1, 0);
        assert_eq!(worker.run_xdp(prog, &mut ctx), XdpAction::Redirect);
        let target = worker.do_redirect(ctx.packet()).unwrap();
        assert!(matches!(target, RedirectTarget::Map { .. }));
    }
    assert_eq!(
        log.take(),
        vec!["a:enqueue:1:64", "a:enqueue:1:64", "a:flush", "b:enqueue:2:64"]
    );

    worker.flush();
    assert_eq!(log.take(), vec!["b:flush"]);
    worker.flush();
    assert!(log.take().is_empty());
}

#[test]
fn test_device_redirect_and_errors() {
    let log = Arc::new(Log::default());
    let small: MapRef = Arc::new(DevMap {
        name: "small",
        log: Arc::clone(&log),
        slots: 1,
    });
    let engine = Engine::new(EngineConfig::default());
    let mut worker = engine.worker();

    let insns = [
        Insn::mov64_imm(Reg::R1, 5),
        Insn::mov64_imm(Reg::R2, 0),
        Insn::emit_call(helper_id::REDIRECT),
        Insn::exit(),
    ];
    let to_dev = engine
        .load(Program::build(&insns, ProgType::Xdp, ProgramFlags::default()).unwrap(), Caps::ADMIN)
        .unwrap();
    let mut ctx = XdpContext::new(vec![0; 64], 1, 0);
    assert_eq!(worker.run_xdp(&to_dev, &mut ctx), XdpAction::Redirect);
    assert!(matches!(worker.do_redirect(ctx.packet()), Ok(RedirectTarget::Device(5))));
    assert!(matches!(worker.do_redirect(ctx.packet()), Err(RedirectError::NoTarget)));

    let missing = forward(&engine, &[small], 0, 3);
    assert_eq!(worker.run_xdp(&missing, &mut ctx), XdpAction::Redirect);
    assert!(matches!(worker.do_redirect(ctx.packet()), Err(RedirectError::NoEntry(3))));
    assert!(log.take().is_empty());

    let unresolved = forward(&engine, &[], 0, 0);
    assert_eq!(worker.run_xdp(&unresolved, &mut ctx), XdpAction::Aborted);
    assert!(!worker.redirect().is_pending());
}
