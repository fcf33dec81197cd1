//! Error kinds surfaced by the kernel core.
//!
//! These are the recoverable conditions only. Structural invariant
//! violations (double free, wrong-holder lock release, broken list links)
//! are bugs and panic instead.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Physical or virtual memory exhausted
    OutOfMemory,
    /// The requested virtual range overlaps an existing mapping
    AlreadyMapped,
    /// The physical address has no direct-map image
    AddressNotInDirectMap,
    /// The virtual address is not covered by any mapping
    NotInAnyMap,
    /// A blocking operation reached its deadline
    Timeout,
    /// The operation was cancelled before it completed
    Cancelled,
    /// Caller passed an invalid argument (unaligned, zero-length, ...)
    BadArgument,
    /// Unexpected internal condition that is still recoverable
    Unexpected,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::AlreadyMapped => "range already mapped",
            Self::AddressNotInDirectMap => "address not in direct map",
            Self::NotInAnyMap => "address not in any map",
            Self::Timeout => "timed out",
            Self::Cancelled => "cancelled",
            Self::BadArgument => "bad argument",
            Self::Unexpected => "unexpected condition",
        };
        f.write_str(msg)
    }
}
