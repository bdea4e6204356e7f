//! Execution dispatcher
//!
//! The only way a program is run. Picks the installed entry, prepares the
//! scratch area of the context, accounts statistics and turns runtime
//! faults into a `0` result.

use std::time::Instant;

use crate::context::{ContextRegions, ProgramContext, XdpContext};
use crate::helpers::HelperRegistry;
use crate::interpreter;
use crate::program::{Entry, Program};
use crate::redirect::{XdpAction, warn_invalid_xdp_action};
use crate::vm::Vm;
use crate::worker::WorkerState;

/// Engine-wide inputs of a run
#[derive(Debug, Clone, Copy)]
pub struct ExecEnv<'a> {
    /// Helpers callable from programs
    pub helpers: &'a HelperRegistry,
    /// Sample run time into the program's statistics
    pub stats_enabled: bool,
}

fn scratch<C: ProgramContext + ?Sized>(ctx: &mut C) -> Option<&mut [u8]> {
    let range = ctx.scratch_range()?;
    let ContextRegions { ctx: bytes, .. } = ctx.regions();
    bytes.get_mut(range)
}

fn execute<C: ProgramContext + ?Sized>(
    prog: &Program,
    ctx: &mut C,
    state: &mut WorkerState,
    env: &ExecEnv<'_>,
) -> u32 {
    let start = env.stats_enabled.then(Instant::now);
    let result = {
        let mut vm = Vm::new(ctx.regions(), state, env.helpers, prog.used_maps());
        match prog.entry() {
            Entry::Compiled(code) => code.execute(&mut vm),
            Entry::Interpreter => interpreter::run(prog.insns(), &mut vm),
        }
    };
    if let Some(start) = start {
        let nsecs = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        prog.aux.stats.record(state.env.id, nsecs);
    }

    match result {
        Ok(ret) => ret as u32,
        Err(fault) => {
            tracing::warn!(
                target: "sieve::dispatch",
                id = prog.id(),
                tag = %prog.tag_hex(),
                %fault,
                "program faulted"
            );
            0
        }
    }
}

/// Run `prog` against `ctx`.
///
/// A program that declared scratch access sees a zeroed area and the
/// caller's contents are restored afterwards; any other program just sees
/// it zeroed.
pub fn run<C: ProgramContext + ?Sized>(
    prog: &Program,
    ctx: &mut C,
    state: &mut WorkerState,
    env: &ExecEnv<'_>,
) -> u32 {
    if prog.flags().cb_access {
        return run_save_cb(prog, ctx, state, env);
    }
    if let Some(area) = scratch(ctx) {
        area.fill(0);
    }
    execute(prog, ctx, state, env)
}

/// Run `prog`, preserving the caller's scratch contents if the program
/// touches them. Programs without scratch access see the area as is.
pub fn run_save_cb<C: ProgramContext + ?Sized>(
    prog: &Program,
    ctx: &mut C,
    state: &mut WorkerState,
    env: &ExecEnv<'_>,
) -> u32 {
    let saved = match scratch(ctx) {
        Some(area) if prog.flags().cb_access => {
            let saved = area.to_vec();
            area.fill(0);
            Some(saved)
        }
        _ => None,
    };
    let ret = execute(prog, ctx, state, env);
    if let (Some(saved), Some(area)) = (saved, scratch(ctx)) {
        area.copy_from_slice(&saved);
    }
    ret
}

/// Run `prog`, zeroing the scratch area first if the program touches it
pub fn run_clear_cb<C: ProgramContext + ?Sized>(
    prog: &Program,
    ctx: &mut C,
    state: &mut WorkerState,
    env: &ExecEnv<'_>,
) -> u32 {
    if prog.flags().cb_access
        && let Some(area) = scratch(ctx)
    {
        area.fill(0);
    }
    execute(prog, ctx, state, env)
}

/// Run an express-data-path program. Results outside the action set are
/// reported and treated as [`XdpAction::Aborted`].
pub fn run_xdp(
    prog: &Program,
    ctx: &mut XdpContext,
    state: &mut WorkerState,
    env: &ExecEnv<'_>,
) -> XdpAction {
    let act = execute(prog, ctx, state, env);
    XdpAction::from_u32(act).unwrap_or_else(|| {
        warn_invalid_xdp_action(act);
        XdpAction::Aborted
    })
}
