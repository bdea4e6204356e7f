//! Code generator contract
//!
//! A generator lowers a program into an image written straight into a
//! writable code region. The region is locked read+exec afterwards and the
//! generator runs the locked image on every invocation.

use sieve_bytecode::Insn;

use crate::error::{Declined, Fault};
use crate::vm::Vm;

/// Outcome of a successful emission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    /// Bytes of the image actually used
    pub len: usize,
    /// Image offset of each instruction slot from the first, ascending.
    /// May stop short of the last slots; lookups past the end find nothing.
    pub insn_offsets: Vec<u32>,
}

impl Emitted {
    /// Check the offset table against the program and image
    pub fn validate(&self, insn_count: usize, reserved: usize) -> Result<(), Declined> {
        if self.len > reserved {
            return Err(Declined::ImageTooSmall {
                need: self.len,
                have: reserved,
            });
        }
        let ascending = self.insn_offsets.windows(2).all(|w| w[0] <= w[1]);
        let in_image = self
            .insn_offsets
            .last()
            .is_none_or(|&last| (last as usize) < self.len.max(1));
        let covered = match self.insn_offsets.len() {
            0 => insn_count == 0,
            n => n <= insn_count,
        };
        if !covered || !ascending || !in_image {
            return Err(Declined::BadOffsets);
        }
        Ok(())
    }
}

/// A backend that turns instructions into executable images
pub trait CodeGenerator: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Upper bound of the image size for `insns`
    fn image_len(&self, insns: &[Insn]) -> usize;

    /// Required alignment of the image start
    fn align(&self) -> usize {
        16
    }

    /// Fill unused code space with a pattern that traps when executed
    fn fill_hole(&self, area: &mut [u8]);

    /// Write the image for `insns` into `image`
    fn emit(&self, insns: &[Insn], image: &mut [u8]) -> Result<Emitted, Declined>;

    /// Run a locked image produced by [`CodeGenerator::emit`]
    fn execute(&self, image: &[u8], vm: &mut Vm<'_>) -> Result<u64, Fault>;
}
