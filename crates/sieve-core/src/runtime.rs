//! Runtime selection
//!
//! Decides once, at load time, whether a program runs compiled or
//! interpreted:
//!
//! 1. blind the immediates if hardening applies to this caller
//! 2. map a code region, let the generator fill it, lock it read+exec
//! 3. install the compiled entry
//!
//! Any failure falls back to the interpreter, restoring the unblinded
//! instructions, unless the policy makes compiled execution mandatory.

use sieve_jit::{Caps, JitPolicy, LockedRegion, WritableRegion};
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use crate::codegen::CodeGenerator;
use crate::error::{CompileError, Fault, LoadError};
use crate::program::{LineInfo, Program};
use crate::vm::Vm;
use sieve_bytecode::Insn;

/// A locked image and the generator that runs it
pub struct CompiledCode {
    region: LockedRegion,
    codegen: Arc<dyn CodeGenerator>,
    insn_offsets: Box<[u32]>,
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("codegen", &self.codegen.name())
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl CompiledCode {
    /// Emitted bytes
    pub fn image(&self) -> &[u8] {
        self.region.image()
    }

    /// Address of the first image byte
    pub fn image_addr(&self) -> usize {
        self.region.image_addr()
    }

    /// Address range of the whole mapping
    pub fn range(&self) -> Range<usize> {
        self.region.range()
    }

    /// Size of the whole mapping
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Image offset of each instruction slot
    pub fn insn_offsets(&self) -> &[u32] {
        &self.insn_offsets
    }

    /// Name of the generator that produced the image
    pub fn codegen_name(&self) -> &'static str {
        self.codegen.name()
    }

    #[inline]
    pub(crate) fn execute(&self, vm: &mut Vm<'_>) -> Result<u64, Fault> {
        self.codegen.execute(self.region.image(), vm)
    }
}

fn compile(
    insns: &[Insn],
    policy: &JitPolicy,
    caps: Caps,
    codegen: &Arc<dyn CodeGenerator>,
) -> Result<CompiledCode, CompileError> {
    let image_len = codegen.image_len(insns);
    let mut region = WritableRegion::alloc(
        image_len,
        codegen.align(),
        |area| codegen.fill_hole(area),
        policy.jit_limit,
        caps.sys_admin,
    )?;
    let emitted = codegen.emit(insns, region.image_mut())?;
    emitted.validate(insns.len(), image_len)?;
    let region = region.lock(emitted.len)?;
    Ok(CompiledCode {
        region,
        codegen: Arc::clone(codegen),
        insn_offsets: emitted.insn_offsets.into_boxed_slice(),
    })
}

fn fill_jited_line_info(line_info: &[LineInfo], code: &CompiledCode) -> Vec<usize> {
    let base = code.image_addr();
    line_info
        .iter()
        .filter_map(|li| code.insn_offsets().get(li.insn_off as usize))
        .map(|&off| base + off as usize)
        .collect()
}

/// Pick the execution engine for `prog`.
///
/// Fails only when `policy.jit_always_on` is set and no compiled entry could
/// be installed.
pub fn select_runtime(
    mut prog: Program,
    policy: &JitPolicy,
    caps: Caps,
    codegen: Option<&Arc<dyn CodeGenerator>>,
) -> Result<Program, LoadError> {
    if prog.is_jited() {
        return Ok(prog);
    }
    let Some(codegen) = codegen.filter(|_| policy.jit_enable && prog.flags.jit_requested) else {
        if policy.jit_always_on {
            return Err(LoadError::JitRequired);
        }
        return Ok(prog);
    };

    let blind = policy.blinding_enabled(true, prog.flags.jit_requested, caps);
    let original = blind.then(|| (prog.insns.clone(), prog.aux.line_info.clone(), prog.flags.blinded));

    let result = if blind {
        prog.blind_constants()
            .map_err(CompileError::from)
            .and_then(|_| compile(&prog.insns, policy, caps, codegen))
    } else {
        compile(&prog.insns, policy, caps, codegen)
    };

    match result {
        Ok(code) => {
            prog.aux.jited_line_info = fill_jited_line_info(&prog.aux.line_info, &code);
            tracing::debug!(
                target: "sieve::jit",
                id = prog.id(),
                codegen = code.codegen_name(),
                image_len = code.image().len(),
                blinded = prog.flags.blinded,
                "compiled entry installed"
            );
            prog.compiled = OnceLock::from(code);
            prog.flags.jited = true;
            Ok(prog)
        }
        Err(err) => {
            if let Some((insns, line_info, blinded)) = original {
                prog.insns = insns;
                prog.aux.line_info = line_info;
                prog.flags.blinded = blinded;
            }
            if policy.jit_always_on {
                return Err(LoadError::Compile(err));
            }
            tracing::warn!(
                target: "sieve::jit",
                id = prog.id(),
                error = %err,
                "compilation failed, falling back to the interpreter"
            );
            Ok(prog)
        }
    }
}
