//! # Sieve RCU
//!
//! Read-mostly publication with grace-period reclamation.
//!
//! ## Design
//!
//! - Readers register once with a [`QuiescentDomain`] and then enter read
//!   sections without taking any lock
//! - Writers publish a replacement, call [`QuiescentDomain::synchronize`] and
//!   only then release the old value
//! - A reader outside a read section is quiescent; a reader inside one is
//!   waited for only if it entered before the grace period started

#![warn(clippy::all)]
#![warn(missing_docs)]

mod cell;
mod domain;

pub use cell::RcuCell;
pub use domain::{QuiescentDomain, ReadGuard, Reader};
