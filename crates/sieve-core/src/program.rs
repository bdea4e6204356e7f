//! Program objects
//!
//! A [`Program`] is built once from verified instructions, optionally
//! blinded and compiled once by [`crate::runtime::select_runtime`], then
//! shared by reference count. Nothing about it changes after it is shared.

use serde::Serialize;
use sha1::{Digest, Sha1};
use sieve_bytecode::opcode::PSEUDO_MAP_FD;
use sieve_bytecode::{AttachType, INSN_SIZE, Insn, ProgType, SockFilter, TAG_SIZE};
use sieve_jit::{BlindError, blind_program};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::engine::Release;
use crate::error::{LoadError, Result};
use crate::helpers::map_handle;
use crate::redirect::MapRef;
use crate::runtime::CompiledCode;
use crate::stats::{ProgramStats, StatsSet};

/// Longest program name, in bytes
pub const PROG_NAME_LEN: usize = 15;

static NEXT_PROG_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a loaded program
pub type ProgramRef = Arc<Program>;

/// Program properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgramFlags {
    /// Compiled code is installed
    pub jited: bool,
    /// Compilation was asked for
    pub jit_requested: bool,
    /// Declared under a GPL-compatible license
    pub gpl_compatible: bool,
    /// Reads or writes the context scratch area
    pub cb_access: bool,
    /// Needs the destination of the packet
    pub dst_needed: bool,
    /// Immediates have been blinded
    pub blinded: bool,
    /// Body of a bpf-to-bpf callee
    pub is_func: bool,
    /// May override a probed function's return value
    pub kprobe_override: bool,
    /// Holds a call-chain buffer reference
    pub has_callchain_buf: bool,
}

impl Default for ProgramFlags {
    /// Compilation requested, everything else clear
    fn default() -> Self {
        Self {
            jited: false,
            jit_requested: true,
            gpl_compatible: false,
            cb_access: false,
            dst_needed: false,
            blinded: false,
            is_func: false,
            kprobe_override: false,
            has_callchain_buf: false,
        }
    }
}

/// Source position of an instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineInfo {
    /// Instruction index the record starts at
    pub insn_off: u32,
    /// Source file
    pub file: String,
    /// Line number
    pub line: u32,
    /// Column
    pub col: u32,
}

/// How a program is executed
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    /// Decode and execute instruction by instruction
    Interpreter,
    /// Run the installed compiled image
    Compiled(&'a CompiledCode),
}

pub(crate) struct ProgramAux {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) stats: StatsSet,
    pub(crate) line_info: Vec<LineInfo>,
    pub(crate) jited_line_info: Vec<usize>,
    pub(crate) used_maps: Vec<MapRef>,
    /// Set once an engine publishes the program
    pub(crate) release: Option<Release>,
}

/// A loaded program
pub struct Program {
    pub(crate) insns: Box<[Insn]>,
    prog_type: ProgType,
    expected_attach_type: AttachType,
    tag: [u8; TAG_SIZE],
    pub(crate) flags: ProgramFlags,
    orig_prog: Option<Box<[SockFilter]>>,
    pub(crate) compiled: OnceLock<CompiledCode>,
    pub(crate) aux: ProgramAux,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.aux.id)
            .field("name", &self.aux.name)
            .field("type", &self.prog_type)
            .field("len", &self.insns.len())
            .field("tag", &self.tag_hex())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some(release) = self.aux.release.take() {
            release.retire(self.aux.id, self.compiled.take());
        }
    }
}

/// Content tag: SHA-1 prefix of the encoded instructions with map
/// references zeroed
fn compute_tag(insns: &[Insn]) -> [u8; TAG_SIZE] {
    let mut hasher = Sha1::new();
    let mut pc = 0;
    while pc < insns.len() {
        let insn = insns[pc];
        if insn.is_ld_imm64() && insn.src().index() == PSEUDO_MAP_FD && pc + 1 < insns.len() {
            let mut lo = insn;
            let mut hi = insns[pc + 1];
            lo.imm = 0;
            hi.imm = 0;
            hasher.update(lo.to_bytes());
            hasher.update(hi.to_bytes());
            pc += 2;
        } else {
            hasher.update(insn.to_bytes());
            pc += 1;
        }
    }
    let digest = hasher.finalize();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&digest[..TAG_SIZE]);
    tag
}

/// Turn map references into plain wide loads of the map handle
fn resolve_map_refs(insns: &mut [Insn]) {
    let mut pc = 0;
    while pc + 1 < insns.len() {
        let insn = insns[pc];
        if insn.is_ld_imm64() && insn.src().index() == PSEUDO_MAP_FD {
            let [lo, hi] = Insn::ld_imm64(insn.dst(), map_handle(insn.imm as u32));
            insns[pc] = lo;
            insns[pc + 1] = hi;
            pc += 2;
        } else if insn.is_ld_imm64() {
            pc += 2;
        } else {
            pc += 1;
        }
    }
}

fn valid_name(name: &str) -> bool {
    name.len() <= PROG_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

impl Program {
    /// Build a program from verified instructions. Computes the tag and
    /// rejects registers outside R0-R10; never blinds or compiles.
    pub fn build(insns: &[Insn], prog_type: ProgType, flags: ProgramFlags) -> Result<Self> {
        if insns.is_empty() {
            return Err(LoadError::Empty);
        }
        sieve_bytecode::check_registers(insns)?;
        let tag = compute_tag(insns);
        let mut insns: Box<[Insn]> = insns.into();
        resolve_map_refs(&mut insns);

        Ok(Self {
            insns,
            prog_type,
            expected_attach_type: AttachType::default(),
            tag,
            flags: ProgramFlags {
                jited: false,
                blinded: false,
                ..flags
            },
            orig_prog: None,
            compiled: OnceLock::new(),
            aux: ProgramAux {
                id: NEXT_PROG_ID.fetch_add(1, Ordering::Relaxed),
                name: String::new(),
                stats: StatsSet::default(),
                line_info: Vec::new(),
                jited_line_info: Vec::new(),
                used_maps: Vec::new(),
                release: None,
            },
        })
    }

    /// Build from little-endian encoded instructions
    pub fn from_bytes(bytes: &[u8], prog_type: ProgType, flags: ProgramFlags) -> Result<Self> {
        let insns = sieve_bytecode::decode_program(bytes)?;
        Self::build(&insns, prog_type, flags)
    }

    /// Set the program name
    pub fn with_name(mut self, name: &str) -> Result<Self> {
        if !valid_name(name) {
            return Err(LoadError::InvalidName(name.to_owned()));
        }
        self.aux.name = name.to_owned();
        Ok(self)
    }

    /// Set the expected attach type
    pub fn with_attach_type(mut self, attach: AttachType) -> Self {
        self.expected_attach_type = attach;
        self
    }

    /// Attach source positions, sorted by instruction
    pub fn with_line_info(mut self, mut line_info: Vec<LineInfo>) -> Self {
        line_info.sort_by_key(|li| li.insn_off);
        line_info.retain(|li| (li.insn_off as usize) < self.insns.len());
        self.aux.line_info = line_info;
        self
    }

    /// Maps the program references by index
    pub fn with_used_maps(mut self, maps: Vec<MapRef>) -> Self {
        self.aux.used_maps = maps;
        self
    }

    pub(crate) fn with_orig_prog(mut self, filter: &[SockFilter]) -> Self {
        self.orig_prog = Some(filter.into());
        self
    }

    pub(crate) fn set_stats_slots(&mut self, slots: usize) {
        self.aux.stats = StatsSet::new(slots);
    }

    /// Blind all immediates. Returns `Ok(false)` if the program was already
    /// blinded.
    pub fn blind_constants(&mut self) -> std::result::Result<bool, BlindError> {
        if self.flags.blinded {
            return Ok(false);
        }
        let blinded = blind_program(&self.insns)?;
        for li in &mut self.aux.line_info {
            if let Some(pc) = blinded.map_pc(li.insn_off as usize) {
                li.insn_off = pc as u32;
            }
        }
        tracing::debug!(
            target: "sieve::jit",
            id = self.aux.id,
            before = self.insns.len(),
            after = blinded.insns.len(),
            "constants blinded"
        );
        self.insns = blinded.insns.into_boxed_slice();
        self.flags.blinded = true;
        Ok(true)
    }

    /// Instructions as executed
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Number of instruction slots
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Size of the instructions in bytes
    pub fn insn_size(&self) -> usize {
        self.insns.len() * INSN_SIZE
    }

    /// Memory held by the program, compiled image included
    pub fn alloc_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.insn_size()
            + self
                .orig_prog
                .as_ref()
                .map_or(0, |f| f.len() * std::mem::size_of::<SockFilter>())
            + self.compiled.get().map_or(0, CompiledCode::size)
    }

    /// Content tag
    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Content tag as lowercase hex
    pub fn tag_hex(&self) -> String {
        hex::encode(self.tag)
    }

    /// Program type
    pub fn prog_type(&self) -> ProgType {
        self.prog_type
    }

    /// Expected attach type
    pub fn expected_attach_type(&self) -> AttachType {
        self.expected_attach_type
    }

    /// Whether the program was migrated from the classic format
    pub fn was_legacy(&self) -> bool {
        self.prog_type == ProgType::Unspec
    }

    /// Flags
    pub fn flags(&self) -> ProgramFlags {
        self.flags
    }

    /// Whether compiled code is installed
    pub fn is_jited(&self) -> bool {
        self.flags.jited
    }

    /// Classic instructions the program was migrated from, when kept
    pub fn orig_prog(&self) -> Option<&[SockFilter]> {
        self.orig_prog.as_deref()
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.aux.id
    }

    /// Name, possibly empty
    pub fn name(&self) -> &str {
        &self.aux.name
    }

    /// Source positions
    pub fn line_info(&self) -> &[LineInfo] {
        &self.aux.line_info
    }

    /// Code address of each line-info record; empty unless compiled
    pub fn jited_line_info(&self) -> &[usize] {
        &self.aux.jited_line_info
    }

    /// Referenced maps
    pub fn used_maps(&self) -> &[MapRef] {
        &self.aux.used_maps
    }

    /// Current entry point
    #[inline]
    pub fn entry(&self) -> Entry<'_> {
        match self.compiled.get() {
            Some(code) => Entry::Compiled(code),
            None => Entry::Interpreter,
        }
    }

    /// Compiled code, if installed
    pub fn compiled(&self) -> Option<&CompiledCode> {
        self.compiled.get()
    }

    /// Run statistics summed over all workers
    pub fn stats(&self) -> ProgramStats {
        self.aux.stats.snapshot()
    }
}
