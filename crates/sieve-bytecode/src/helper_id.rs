//! Helper function ids carried in the immediate of a call instruction

/// Monotonic clock in nanoseconds
pub const KTIME_GET_NS: i32 = 5;
/// Pseudo-random 32-bit number
pub const GET_PRANDOM_U32: i32 = 7;
/// Id of the executing worker
pub const GET_SMP_PROCESSOR_ID: i32 = 8;
/// Forward to an interface index
pub const REDIRECT: i32 = 23;
/// Forward through an output map
pub const REDIRECT_MAP: i32 = 51;

/// Netlink attribute lookup used by migrated classic programs
pub const SKB_GET_NLATTR: i32 = 0x1000;
/// Nested netlink attribute lookup used by migrated classic programs
pub const SKB_GET_NLATTR_NEST: i32 = 0x1001;

/// First id available for embedder-registered helpers
pub const FIRST_CUSTOM: i32 = 0x2000;
