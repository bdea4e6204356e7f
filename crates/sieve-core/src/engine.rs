//! Engine facade
//!
//! An [`Engine`] owns everything shared between workers: the configuration,
//! the quiescent domain, the symbol directories, the helper table and the
//! code generator. Each thread that runs programs takes a [`Worker`].

use sieve_bytecode::{ProgType, SockFilter};
use sieve_jit::{Caps, JitPolicy, SymbolEntry, SymbolHit, Symbolizer, parse_env_truthy, symbol_name};
use sieve_rcu::{QuiescentDomain, Reader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::attach::Attachment;
use crate::codegen::CodeGenerator;
use crate::context::{ProgramContext, XdpContext};
use crate::dispatch::{self, ExecEnv};
use crate::error::Result;
use crate::helpers::HelperRegistry;
use crate::legacy;
use crate::program::{Program, ProgramFlags, ProgramRef};
use crate::redirect::{RedirectError, RedirectInfo, RedirectTarget, XdpAction};
use crate::runtime::{CompiledCode, select_runtime};
use crate::threaded::ThreadedCodegen;
use crate::worker::WorkerState;

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// JIT knobs
    pub policy: JitPolicy,
    /// Sample run times from the start
    pub stats_enabled: bool,
    /// Statistics slots per program
    pub stats_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: JitPolicy::default(),
            stats_enabled: false,
            stats_slots: std::thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

impl EngineConfig {
    /// Policy from the `SIEVE_JIT_*` variables, statistics from `SIEVE_STATS`
    pub fn from_env() -> Self {
        Self {
            policy: JitPolicy::from_env(),
            stats_enabled: std::env::var("SIEVE_STATS").is_ok_and(|v| parse_env_truthy(&v)),
            ..Self::default()
        }
    }
}

struct EngineShared {
    config: EngineConfig,
    domain: QuiescentDomain,
    symbols: Symbolizer,
    helpers: HelperRegistry,
    codegen: Option<Arc<dyn CodeGenerator>>,
    stats_enabled: AtomicBool,
    next_worker: AtomicU32,
}

/// Unpublishes a program when its last reference goes away
pub(crate) struct Release {
    shared: Arc<EngineShared>,
}

impl Release {
    /// Drop the symbols of program `id` and queue `code` for the next
    /// reclaim. Never waits, so any holder may drop the last reference.
    pub(crate) fn retire(self, id: u64, code: Option<CompiledCode>) {
        let unpublished = self.shared.symbols.remove(id);
        if let Some(code) = code {
            self.shared.domain.defer(move || drop(code));
        }
        tracing::info!(target: "sieve::load", id, unpublished, "program released");
    }
}

/// Shared engine handle
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("codegen", &self.shared.codegen.as_ref().map(|c| c.name()))
            .field("helpers", &self.shared.helpers.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine with the portable code generator and the built-in helpers
    pub fn new(config: EngineConfig) -> Self {
        Self::from_parts(
            config,
            Some(Arc::new(ThreadedCodegen::new())),
            HelperRegistry::with_builtins(),
        )
    }

    /// Engine with an explicit generator (`None` interprets everything) and
    /// helper table
    pub fn from_parts(
        config: EngineConfig,
        codegen: Option<Arc<dyn CodeGenerator>>,
        helpers: HelperRegistry,
    ) -> Self {
        let domain = QuiescentDomain::new();
        Self {
            shared: Arc::new(EngineShared {
                config,
                symbols: Symbolizer::new(&domain),
                domain,
                helpers,
                codegen,
                stats_enabled: AtomicBool::new(config.stats_enabled),
                next_worker: AtomicU32::new(0),
            }),
        }
    }

    /// Configuration the engine was created with
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Reclamation domain of the engine
    pub fn domain(&self) -> &QuiescentDomain {
        &self.shared.domain
    }

    /// Select the runtime for `program` and publish its symbols
    pub fn load(&self, mut program: Program, caps: Caps) -> Result<ProgramRef> {
        let policy = self.shared.config.policy;
        program.flags.jit_requested &= policy.jit_enable;
        program.set_stats_slots(self.shared.config.stats_slots);

        let mut program = select_runtime(program, &policy, caps, self.shared.codegen.as_ref())?;
        program.aux.release = Some(Release {
            shared: Arc::clone(&self.shared),
        });
        if let Some(code) = program.compiled() {
            self.shared.symbols.add(
                symbol_name(program.tag(), program.name()),
                code.range(),
                program.id(),
                policy.symbols_visible(),
            );
        }
        tracing::info!(
            target: "sieve::load",
            id = program.id(),
            name = program.name(),
            tag = %program.tag_hex(),
            insns = program.insn_count(),
            jited = program.is_jited(),
            "program loaded"
        );
        Ok(Arc::new(program))
    }

    /// Migrate and load a classic program. With `save_orig` the classic
    /// instructions are kept on the program.
    pub fn load_classic(&self, filter: &[SockFilter], save_orig: bool, caps: Caps) -> Result<ProgramRef> {
        let insns = legacy::migrate(filter)?;
        let mut program = Program::build(&insns, ProgType::Unspec, ProgramFlags::default())?;
        if save_orig {
            program = program.with_orig_prog(filter);
        }
        self.load(program, caps)
    }

    /// Drop a reference. Whichever reference is dropped last unregisters
    /// the symbols and queues the code for reclaim; this one then waits for
    /// a grace period and frees it. Returns whether the program was freed.
    /// Must not be called from inside a read section.
    pub fn destroy(&self, prog: ProgramRef) -> bool {
        let Some(program) = Arc::into_inner(prog) else {
            return false;
        };
        let id = program.id();
        drop(program);
        self.shared.domain.reclaim();
        tracing::info!(target: "sieve::load", id, "program destroyed");
        true
    }

    /// Free code and symbol tables released since the last call. Returns
    /// the number of deferred frees run. Must not be called from inside a
    /// read section.
    pub fn reclaim(&self) -> usize {
        self.shared.domain.reclaim()
    }

    /// New attachment point in this engine's domain
    pub fn attachment(&self) -> Attachment {
        Attachment::new(&self.shared.domain)
    }

    /// New worker with its own id, reader registration and state
    pub fn worker(&self) -> Worker {
        let id = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
        Worker {
            engine: self.clone(),
            reader: self.shared.domain.register(),
            state: WorkerState::new(id),
        }
    }

    /// Toggle run-time sampling
    pub fn set_stats_enabled(&self, enabled: bool) {
        self.shared.stats_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether run times are sampled
    pub fn stats_enabled(&self) -> bool {
        self.shared.stats_enabled.load(Ordering::Relaxed)
    }

    /// Whether raw instructions and code addresses may be exposed
    pub fn dump_raw_ok(&self) -> bool {
        self.shared.config.policy.symbols_visible()
    }

    /// Visible symbols in address order
    pub fn symbols(&self) -> Vec<SymbolEntry> {
        let reader = self.shared.domain.register();
        let guard = reader.read_lock();
        self.shared.symbols.symbols(&guard)
    }

    fn exec_env(&self) -> ExecEnv<'_> {
        ExecEnv {
            helpers: &self.shared.helpers,
            stats_enabled: self.stats_enabled(),
        }
    }
}

/// Per-thread execution handle
#[derive(Debug)]
pub struct Worker {
    engine: Engine,
    reader: Reader,
    state: WorkerState,
}

impl Worker {
    /// Worker id
    pub fn id(&self) -> u32 {
        self.state.env.id
    }

    /// Run `prog` against `ctx`
    pub fn run<C: ProgramContext + ?Sized>(&mut self, prog: &Program, ctx: &mut C) -> u32 {
        dispatch::run(prog, ctx, &mut self.state, &self.engine.exec_env())
    }

    /// Run preserving scratch contents for programs that use them
    pub fn run_save_cb<C: ProgramContext + ?Sized>(&mut self, prog: &Program, ctx: &mut C) -> u32 {
        dispatch::run_save_cb(prog, ctx, &mut self.state, &self.engine.exec_env())
    }

    /// Run clearing scratch contents for programs that use them
    pub fn run_clear_cb<C: ProgramContext + ?Sized>(&mut self, prog: &Program, ctx: &mut C) -> u32 {
        dispatch::run_clear_cb(prog, ctx, &mut self.state, &self.engine.exec_env())
    }

    /// Run an express-data-path program
    pub fn run_xdp(&mut self, prog: &Program, ctx: &mut XdpContext) -> XdpAction {
        dispatch::run_xdp(prog, ctx, &mut self.state, &self.engine.exec_env())
    }

    /// Run whatever is attached to `attachment`; `None` when it is empty
    pub fn run_attached<C: ProgramContext + ?Sized>(
        &mut self,
        attachment: &Attachment,
        ctx: &mut C,
    ) -> Option<u32> {
        let guard = self.reader.read_lock();
        let prog = attachment.current(&guard)?;
        Some(dispatch::run(prog, ctx, &mut self.state, &self.engine.exec_env()))
    }

    /// Redirect state of this worker
    pub fn redirect(&mut self) -> &mut RedirectInfo {
        &mut self.state.env.redirect
    }

    /// Forward `packet` according to the pending decision
    pub fn do_redirect(&mut self, packet: &[u8]) -> std::result::Result<RedirectTarget, RedirectError> {
        self.state.env.redirect.do_redirect(packet)
    }

    /// End of a poll cycle
    pub fn flush(&mut self) {
        self.state.env.redirect.flush();
    }

    /// Visible symbol covering `addr`
    pub fn lookup_symbol(&self, addr: usize) -> Option<SymbolHit> {
        let guard = self.reader.read_lock();
        self.engine.shared.symbols.lookup(&guard, addr)
    }

    /// Whether `addr` lies in compiled code, visible or not
    pub fn is_text_address(&self, addr: usize) -> bool {
        let guard = self.reader.read_lock();
        self.engine.shared.symbols.is_text_address(&guard, addr)
    }

    /// Engine this worker belongs to
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
