//! Attachment points
//!
//! An attachment holds at most one program. Workers read it inside a read
//! section without locking; replacing the program waits for every section
//! that could still see the old one before handing it back.

use sieve_rcu::{QuiescentDomain, RcuCell, ReadGuard};

use crate::program::{Program, ProgramRef};

/// A hook programs can be attached to
pub struct Attachment {
    slot: RcuCell<Program>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("attached", &self.slot.is_set())
            .finish()
    }
}

impl Attachment {
    /// Empty attachment point in `domain`
    pub fn new(domain: &QuiescentDomain) -> Self {
        Self {
            slot: RcuCell::empty(domain),
        }
    }

    /// Install `prog`, returning the previous program once no reader can
    /// observe it. Must not be called from inside a read section.
    pub fn attach(&self, prog: ProgramRef) -> Option<ProgramRef> {
        tracing::info!(target: "sieve::load", id = prog.id(), "program attached");
        self.slot.replace(Some(prog))
    }

    /// Remove the attached program; same grace-period rules as
    /// [`Attachment::attach`]
    pub fn detach(&self) -> Option<ProgramRef> {
        let old = self.slot.replace(None);
        if let Some(prog) = &old {
            tracing::info!(target: "sieve::load", id = prog.id(), "program detached");
        }
        old
    }

    /// Whether a program is attached
    pub fn is_attached(&self) -> bool {
        self.slot.is_set()
    }

    /// Current program, valid for the duration of `guard`
    #[inline]
    pub fn current<'g>(&'g self, guard: &'g ReadGuard<'_>) -> Option<&'g Program> {
        self.slot.load(guard)
    }
}
