//! # Sieve Core
//!
//! Program objects and their execution for the sieve packet-filter engine.
//!
//! ## Architecture
//!
//! ```text
//!   classic filter ──legacy──┐
//!                            ▼
//!   instructions ───────► Program ──select_runtime──► Program (+ compiled entry)
//!                                                        │
//!                           Worker::run ──dispatch───────┘
//!                                 │
//!                     interpreter │ compiled image
//!                                 ▼
//!                                Vm ── helpers ── redirect state
//! ```
//!
//! - [`program`]: build, tag and query programs
//! - [`runtime`]: blinding, code-region setup and entry installation
//! - [`dispatch`]: the single run entry point, scratch handling, statistics
//! - [`interpreter`] and [`threaded`]: the two execution engines over [`vm`]
//! - [`legacy`]: checking and migrating classic socket filters
//! - [`engine`]: shared state, workers, load and destroy

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod attach;
pub mod codegen;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod helpers;
pub mod interpreter;
pub mod legacy;
pub mod program;
pub mod redirect;
pub mod runtime;
pub mod stats;
pub mod threaded;
pub mod vm;
pub mod worker;

pub use attach::Attachment;
pub use codegen::{CodeGenerator, Emitted};
pub use context::{ContextRegions, ProgramContext, SkBuffContext, XdpContext};
pub use engine::{Engine, EngineConfig, Worker};
pub use error::{CompileError, Declined, Fault, LoadError, MigrateError, Result};
pub use helpers::{HelperCtx, HelperFn, HelperRegistry};
pub use program::{Entry, LineInfo, Program, ProgramFlags, ProgramRef};
pub use redirect::{
    ForwardMap, MapRef, NetDevice, RedirectError, RedirectInfo, RedirectTarget, XdpAction, ok_fwd_dev,
};
pub use runtime::{CompiledCode, select_runtime};
pub use stats::ProgramStats;
pub use threaded::ThreadedCodegen;
pub use worker::WorkerState;

pub use sieve_bytecode as bytecode;
pub use sieve_jit::{Caps, Harden, JitPolicy};
