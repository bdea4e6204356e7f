//! Program description files.
//!
//! ```json
//! { "kind": "classic", "filter": [{ "code": 40, "jt": 0, "jf": 0, "k": 12 }, ...] }
//! { "kind": "native", "prog_type": "xdp", "bytecode": "b7000000...", "name": "fwd" }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use sieve_core::bytecode::{ProgType, SockFilter};
use sieve_core::{Caps, Engine, Program, ProgramFlags, ProgramRef};
use std::path::Path;

/// A program to load, plus optional sample packets
#[derive(Debug, Deserialize)]
pub struct ProgramFile {
    #[serde(flatten)]
    pub source: Source,

    /// Hex-encoded frames to run when none are given on the command line
    #[serde(default)]
    pub packets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Classic {
        filter: Vec<SockFilter>,
        /// Keep the classic instructions alongside the migrated program
        #[serde(default)]
        save_orig: bool,
    },
    Native {
        #[serde(default)]
        prog_type: ProgType,
        /// Hex-encoded instruction stream
        bytecode: String,
        name: Option<String>,
    },
}

impl ProgramFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn prog_type(&self) -> ProgType {
        match &self.source {
            Source::Classic { .. } => ProgType::Unspec,
            Source::Native { prog_type, .. } => *prog_type,
        }
    }

    /// Build and load the program into `engine`
    pub fn install(&self, engine: &Engine, caps: Caps) -> Result<ProgramRef> {
        let prog = match &self.source {
            Source::Classic { filter, save_orig } => engine.load_classic(filter, *save_orig, caps)?,
            Source::Native {
                prog_type,
                bytecode,
                name,
            } => {
                let bytes = hex::decode(bytecode.trim()).context("bytecode is not valid hex")?;
                let mut program = Program::from_bytes(&bytes, *prog_type, ProgramFlags::default())?;
                if let Some(name) = name {
                    program = program.with_name(name)?;
                }
                engine.load(program, caps)?
            }
        };
        tracing::debug!(target: "sieve::cli", id = prog.id(), jited = prog.is_jited(), "program installed");
        Ok(prog)
    }
}
