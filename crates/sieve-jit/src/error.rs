//! JIT error types

use thiserror::Error;

/// Constant blinding could not produce a valid program.
///
/// Always recoverable: the caller keeps the unblinded program and falls back
/// to the interpreter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlindError {
    /// A relocated branch no longer fits its 16-bit displacement
    #[error("relocated branch at {pc} needs offset {offset}, outside i16")]
    BranchOutOfRange {
        /// Instruction index in the rewritten program
        pc: usize,
        /// Displacement that would be required
        offset: i64,
    },

    /// A relocated call no longer fits its 32-bit immediate
    #[error("relocated call at {pc} needs offset {offset}, outside i32")]
    CallOutOfRange {
        /// Instruction index in the rewritten program
        pc: usize,
        /// Displacement that would be required
        offset: i64,
    },

    /// A branch or call points outside the program
    #[error("instruction {pc} targets {target}, program has {len} slots")]
    BadTarget {
        /// Instruction index in the input program
        pc: usize,
        /// Target index
        target: i64,
        /// Program length
        len: usize,
    },
}

/// Code-region allocation or protection failure
#[derive(Debug, Error)]
pub enum RegionError {
    /// The anonymous mapping could not be created
    #[error("mapping {size} bytes failed: {source}")]
    Map {
        /// Requested mapping size
        size: usize,
        /// OS error
        source: std::io::Error,
    },

    /// Changing page protection failed
    #[error("mprotect failed: {0}")]
    Protect(std::io::Error),

    /// The global JIT memory budget would be exceeded
    #[error("jit memory limit exceeded: {requested} bytes requested, {in_use} of {limit} in use")]
    LimitExceeded {
        /// Bytes requested
        requested: usize,
        /// Bytes currently charged
        in_use: usize,
        /// Configured limit
        limit: usize,
    },

    /// An image of zero bytes was requested
    #[error("empty image")]
    EmptyImage,

    /// Executable mappings are not available on this platform
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}
