//! # Sieve JIT
//!
//! Compile-time machinery shared by every code generator:
//!
//! - [`blind`]: constant blinding of immediates through the hidden AX register
//! - [`region`]: page-backed code regions that are writable once, then
//!   read+exec forever
//! - [`symbols`]: address to name directories for compiled programs
//! - [`policy`]: hardening and visibility knobs

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod blind;
pub mod error;
pub mod policy;
pub mod region;
pub mod symbols;

pub use blind::{Blinded, blind_program, blind_program_with};
pub use error::{BlindError, RegionError};
pub use policy::{Caps, Harden, JitPolicy, parse_env_truthy};
pub use region::{LockedRegion, WritableRegion, jit_memory_in_use, page_size};
pub use symbols::{SymbolEntry, SymbolHit, Symbolizer, symbol_name};
